//! # Node Contract
//!
//! A node is split in two:
//! - `Node`: the graph-level definition (ports, parameters, amplification).
//!   Shared by every evaluation of the graph.
//! - `NodeTask`: the per-branch evaluation state created from a `Node`. It
//!   carries the progress of one evaluation across ticks, so `process` can be
//!   called again and again without restarting work.
//!
//! A task goes through three phases each time the walk visits it:
//! `set_input_values` gathers inputs, `process` advances the computation and
//! reports completion, `cache_output_values` publishes outputs once.

use crate::branch::OutputValue;
use crate::graph::{Graph, GraphEdit};
use crate::nodes::NodeParams;
use crate::pool::{BufferPool, Element, Pack, PooledBuffer};
use crate::{FlowError, JobHandle, JobRuntime, MeshSettings, NodeGuid, PortKind, PortRef, PortSpec};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// NODE TRAITS
// =============================================================================

/// Graph-level definition of a processing node.
pub trait Node: Send + Sync + fmt::Debug {
    /// Registry name of this node kind.
    fn kind(&self) -> &'static str;

    /// Input ports.
    fn inputs(&self) -> &[PortSpec];

    /// Output ports.
    fn outputs(&self) -> &[PortSpec];

    /// Border cells this node needs around height maps it reads.
    fn padding(&self) -> u32 {
        0
    }

    /// Whether an input may be wired to a source of another kind because
    /// amplification will insert a conversion in between.
    fn adapts_input(&self, _port: &str, _source: PortKind) -> bool {
        false
    }

    /// One-time graph rewrite before evaluation. Returns `true` if the node
    /// changed the graph.
    fn amplify_graph(&self, _amplifier: &mut Amplifier<'_>) -> bool {
        false
    }

    /// Fresh evaluation state for one branch.
    fn create_task(&self, settings: &MeshSettings) -> Box<dyn NodeTask>;

    /// Parameters needed to recreate this node from a payload.
    fn params(&self) -> NodeParams {
        NodeParams::default()
    }

    /// Look up an input port by name.
    fn input(&self, name: &str) -> Option<&PortSpec> {
        self.inputs().iter().find(|spec| spec.name == name)
    }

    /// Look up an output port by name.
    fn output(&self, name: &str) -> Option<&PortSpec> {
        self.outputs().iter().find(|spec| spec.name == name)
    }
}

/// Per-branch evaluation state of one node.
pub trait NodeTask: Send {
    /// Gather inputs. Returns `false` if any required input is unavailable;
    /// the walk retries later.
    fn set_input_values(&mut self, inputs: &mut Inputs<'_>) -> bool;

    /// Advance the computation. Returns `true` once fully complete, including
    /// every job it scheduled. Must be safe to call repeatedly.
    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<bool, FlowError>;

    /// Publish outputs after `process` reported completion.
    fn cache_output_values(&mut self, outputs: &mut Outputs<'_>);
}

// =============================================================================
// INPUTS
// =============================================================================

/// Input side of a task: resolves ports through the edge table and reads the
/// branch output cache.
pub struct Inputs<'a> {
    graph: &'a Graph,
    branch: &'a crate::Branch,
    node: NodeGuid,
    pending_upstream: Option<NodeGuid>,
    disconnected: Vec<String>,
    handles: Vec<JobHandle>,
}

impl<'a> Inputs<'a> {
    pub(crate) fn new(graph: &'a Graph, branch: &'a crate::Branch, node: NodeGuid) -> Self {
        Self {
            graph,
            branch,
            node,
            pending_upstream: None,
            disconnected: Vec::new(),
            handles: Vec::new(),
        }
    }

    /// The node whose inputs are being resolved.
    #[must_use]
    pub fn node(&self) -> NodeGuid {
        self.node
    }

    /// Settings of the evaluating branch.
    #[must_use]
    pub fn settings(&self) -> &MeshSettings {
        self.branch.settings()
    }

    /// Whether an edge feeds this port.
    #[must_use]
    pub fn is_connected(&self, port: &str) -> bool {
        self.graph
            .source_of(&PortRef::new(self.node, port))
            .is_some()
    }

    /// Read the value feeding `port`.
    ///
    /// Returns `None` when the port has no edge, when the upstream node has
    /// not been evaluated in this branch yet (the walk will descend into it),
    /// or when the upstream value has another type.
    pub fn try_get_input<T: Any + Send + Sync>(&mut self, port: &str) -> Option<Arc<T>> {
        let Some(source) = self.graph.source_of(&PortRef::new(self.node, port)) else {
            self.disconnected.push(port.to_string());
            return None;
        };

        match self.branch.output(source) {
            Some(value) => {
                let data = value.downcast::<T>();
                if data.is_some() {
                    self.handles.push(value.handle().clone());
                } else {
                    tracing::warn!(
                        node = %self.node,
                        source = %source,
                        expected = std::any::type_name::<T>(),
                        "input has unexpected type"
                    );
                }
                data
            }
            None => {
                if !self.branch.is_completed(source.node) {
                    self.pending_upstream.get_or_insert(source.node);
                }
                None
            }
        }
    }

    /// Job handle of the value feeding `port`, if it is cached.
    #[must_use]
    pub fn input_handle(&self, port: &str) -> Option<JobHandle> {
        let source = self.graph.source_of(&PortRef::new(self.node, port))?;
        self.branch.output(source).map(|value| value.handle().clone())
    }

    /// Combined handle of every input read so far.
    #[must_use]
    pub fn dependencies(&self) -> JobHandle {
        JobHandle::combine(&self.handles)
    }

    pub(crate) fn pending_upstream(&self) -> Option<NodeGuid> {
        self.pending_upstream
    }

    pub(crate) fn disconnected(&self) -> &[String] {
        &self.disconnected
    }
}

// =============================================================================
// PROCESS CONTEXT
// =============================================================================

/// Resources a task may use while processing.
///
/// Every buffer it acquires and every job it schedules is tracked by the
/// branch pack, so the pack is never freed under a running job.
pub struct ProcessContext<'a> {
    node: NodeGuid,
    settings: &'a MeshSettings,
    runtime: &'a JobRuntime,
    pool: &'a mut BufferPool,
    pack: &'a mut Pack,
}

impl<'a> ProcessContext<'a> {
    pub(crate) fn new(
        node: NodeGuid,
        settings: &'a MeshSettings,
        runtime: &'a JobRuntime,
        pool: &'a mut BufferPool,
        pack: &'a mut Pack,
    ) -> Self {
        Self {
            node,
            settings,
            runtime,
            pool,
            pack,
        }
    }

    /// The node being processed.
    #[must_use]
    pub fn node(&self) -> NodeGuid {
        self.node
    }

    /// Settings of the evaluating branch.
    #[must_use]
    pub fn settings(&self) -> &MeshSettings {
        self.settings
    }

    /// The runtime jobs are scheduled on.
    #[must_use]
    pub fn runtime(&self) -> &JobRuntime {
        self.runtime
    }

    /// Buffer of `len` elements owned by the branch pack.
    pub fn acquire<T: Element>(&mut self, len: usize) -> PooledBuffer<T> {
        self.pool.acquire(self.pack, len)
    }

    /// Buffer holding a copy of `source`, owned by the branch pack.
    pub fn acquire_from<T: Element>(&mut self, source: &[T]) -> PooledBuffer<T> {
        self.pool.acquire_from(self.pack, source)
    }

    /// Schedule `work` behind `dependency` and track the job.
    pub fn schedule<F>(&mut self, dependency: &JobHandle, work: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = self.runtime.schedule(dependency, work);
        self.pack.track(handle.clone());
        handle
    }

    /// Schedule `count` parallel batches behind `dependency` and track them.
    pub fn schedule_batch<F>(&mut self, dependency: &JobHandle, count: usize, work: F) -> JobHandle
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let handle = self.runtime.schedule_batch(dependency, count, work);
        self.pack.track(handle.clone());
        handle
    }

    /// Track a handle produced outside this context.
    pub fn track(&mut self, handle: JobHandle) {
        self.pack.track(handle);
    }
}

// =============================================================================
// OUTPUTS
// =============================================================================

/// Output side of a task: publishes into the branch output cache.
pub struct Outputs<'a> {
    node: NodeGuid,
    ports: &'a [PortSpec],
    cache: &'a mut HashMap<PortRef, OutputValue>,
}

impl<'a> Outputs<'a> {
    pub(crate) fn new(
        node: NodeGuid,
        ports: &'a [PortSpec],
        cache: &'a mut HashMap<PortRef, OutputValue>,
    ) -> Self {
        Self { node, ports, cache }
    }

    /// Publish `value` on `port`, produced by the job behind `handle`.
    pub fn publish<T: Any + Send + Sync>(&mut self, port: &str, value: T, handle: JobHandle) {
        self.publish_value(port, OutputValue::new(value, handle));
    }

    /// Publish an already shared value, e.g. forwarding an input.
    pub fn publish_arc<T: Any + Send + Sync>(&mut self, port: &str, value: Arc<T>, handle: JobHandle) {
        self.publish_value(port, OutputValue::from_arc(value, handle));
    }

    fn publish_value(&mut self, port: &str, value: OutputValue) {
        if !self.ports.iter().any(|spec| spec.name == port) {
            tracing::warn!(node = %self.node, port, "publish on undeclared output ignored");
            return;
        }
        self.cache.insert(PortRef::new(self.node, port), value);
    }
}

// =============================================================================
// AMPLIFIER
// =============================================================================

/// Graph view handed to `Node::amplify_graph`.
///
/// Edits are queued and applied by the graph after the node returns.
pub struct Amplifier<'a> {
    graph: &'a Graph,
    node: NodeGuid,
    next_guid: u64,
    edits: Vec<GraphEdit>,
}

impl<'a> Amplifier<'a> {
    pub(crate) fn new(graph: &'a Graph, node: NodeGuid) -> Self {
        Self {
            graph,
            node,
            next_guid: graph.next_guid(),
            edits: Vec::new(),
        }
    }

    /// The node being amplified.
    #[must_use]
    pub fn node(&self) -> NodeGuid {
        self.node
    }

    /// Read-only view of the graph.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        self.graph
    }

    /// Source feeding `port` of the amplified node, with the source kind.
    #[must_use]
    pub fn source_of(&self, port: &str) -> Option<(PortRef, PortKind)> {
        let source = self.graph.source_of(&PortRef::new(self.node, port))?;
        let kind = self.graph.node(source.node)?.output(&source.port)?.kind;
        Some((source.clone(), kind))
    }

    /// Insert a hidden auxiliary node. Returns its guid.
    pub fn insert_node(&mut self, node: Box<dyn Node>) -> NodeGuid {
        let guid = NodeGuid(self.next_guid);
        self.next_guid = self.next_guid.saturating_add(1);
        self.edits.push(GraphEdit::Insert { guid, node });
        guid
    }

    /// Connect two ports (replace semantics on the input side).
    pub fn connect(&mut self, from: PortRef, to: PortRef) {
        self.edits.push(GraphEdit::Connect { from, to });
    }

    pub(crate) fn into_edits(self) -> Vec<GraphEdit> {
        self.edits
    }
}
