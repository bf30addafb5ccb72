//! # Evaluation Branch
//!
//! A branch is one independent evaluation of a subset of the graph under one
//! set of mesh settings. It owns:
//! - the output cache, keyed by output port
//! - the per-node task state of nodes that have not completed
//! - the buffer pack every buffer of this evaluation is acquired into
//!
//! Branches are pooled. Releasing one hands its pack to the buffer pool for
//! deferred disposal and keeps the emptied maps for the next evaluation.

use crate::node::NodeTask;
use crate::pool::{BufferPool, Pack};
use crate::{JobHandle, MeshSettings, NodeGuid, PortRef};
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// OUTPUT VALUES
// =============================================================================

/// A cached output: type-erased data plus the handle of the job producing it.
#[derive(Clone)]
pub struct OutputValue {
    data: Arc<dyn Any + Send + Sync>,
    handle: JobHandle,
}

impl OutputValue {
    /// Wrap `value` produced behind `handle`.
    pub fn new<T: Any + Send + Sync>(value: T, handle: JobHandle) -> Self {
        Self {
            data: Arc::new(value),
            handle,
        }
    }

    /// Wrap an already shared value.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>, handle: JobHandle) -> Self {
        Self {
            data: value,
            handle,
        }
    }

    /// Typed view of the value, `None` if it holds another type.
    #[must_use]
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.data).downcast::<T>().ok()
    }

    /// Whether the value holds a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.data.as_ref().is::<T>()
    }

    /// Handle of the job producing the value.
    #[must_use]
    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }
}

impl fmt::Debug for OutputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputValue")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// BRANCH
// =============================================================================

/// State of one evaluation.
pub struct Branch {
    id: u64,
    settings: MeshSettings,
    roots: Vec<NodeGuid>,
    pack: Option<Pack>,
    outputs: HashMap<PortRef, OutputValue>,
    completed: BTreeSet<NodeGuid>,
    tasks: HashMap<NodeGuid, Box<dyn NodeTask>>,
    generation: u32,
}

impl Branch {
    fn new(id: u64, settings: MeshSettings, roots: Vec<NodeGuid>, pack: Pack) -> Self {
        Self {
            id,
            settings,
            roots,
            pack: Some(pack),
            outputs: HashMap::new(),
            completed: BTreeSet::new(),
            tasks: HashMap::new(),
            generation: 0,
        }
    }

    /// Pool-unique branch id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Settings of this evaluation.
    #[must_use]
    pub fn settings(&self) -> &MeshSettings {
        &self.settings
    }

    /// Nodes this branch evaluates.
    #[must_use]
    pub fn roots(&self) -> &[NodeGuid] {
        &self.roots
    }

    /// How many times this branch has been reused.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether `node` completed in this branch.
    #[must_use]
    pub fn is_completed(&self, node: NodeGuid) -> bool {
        self.completed.contains(&node)
    }

    /// Number of completed nodes.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Cached value of an output port, finished or not.
    #[must_use]
    pub fn output(&self, port: &PortRef) -> Option<&OutputValue> {
        self.outputs.get(port)
    }

    /// Number of cached outputs.
    #[must_use]
    pub fn cached_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Finished value of `field` on `node`.
    ///
    /// `None` until the producing job has completed, so callers never observe
    /// a buffer that is still being written.
    #[must_use]
    pub fn try_get_output_data<T: Any + Send + Sync>(
        &self,
        node: NodeGuid,
        field: &str,
    ) -> Option<Arc<T>> {
        let value = self.outputs.get(&PortRef::new(node, field))?;
        if !value.handle().is_completed() {
            return None;
        }
        value.downcast::<T>()
    }

    /// The buffer pack of this evaluation.
    #[must_use]
    pub fn pack(&self) -> Option<&Pack> {
        self.pack.as_ref()
    }

    /// Handle completing once every job of this branch has.
    #[must_use]
    pub fn completion(&self) -> JobHandle {
        let mut handles: Vec<JobHandle> = self
            .outputs
            .values()
            .map(|value| value.handle().clone())
            .collect();
        if let Some(pack) = &self.pack {
            handles.push(pack.completion());
        }
        JobHandle::combine(&handles)
    }

    pub(crate) fn take_task(&mut self, node: NodeGuid) -> Option<Box<dyn NodeTask>> {
        self.tasks.remove(&node)
    }

    pub(crate) fn park_task(&mut self, node: NodeGuid, task: Box<dyn NodeTask>) {
        self.tasks.insert(node, task);
    }

    pub(crate) fn mark_completed(&mut self, node: NodeGuid) {
        self.completed.insert(node);
    }

    pub(crate) fn outputs_mut(&mut self) -> &mut HashMap<PortRef, OutputValue> {
        &mut self.outputs
    }

    /// Settings and pack borrowed together for processing a node.
    pub(crate) fn process_parts(&mut self, pool: &mut BufferPool) -> (&MeshSettings, &mut Pack) {
        let pack = self.pack.get_or_insert_with(|| pool.new_pack());
        (&self.settings, pack)
    }

    fn take_pack(&mut self) -> Option<Pack> {
        self.pack.take()
    }

    fn clear(&mut self) {
        self.outputs.clear();
        self.completed.clear();
        self.tasks.clear();
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("roots", &self.roots)
            .field("generation", &self.generation)
            .field("outputs", &self.outputs.len())
            .field("completed", &self.completed)
            .field("pending_tasks", &self.tasks.len())
            .field("pack", &self.pack)
            .finish()
    }
}

// =============================================================================
// BRANCH POOL
// =============================================================================

/// Recycles branches between evaluations.
#[derive(Debug, Default)]
pub struct BranchPool {
    free: Vec<Branch>,
    next_id: u64,
    created: u64,
    reused: u64,
}

impl BranchPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A branch for `roots` under `settings`, with a fresh pack.
    pub fn acquire(
        &mut self,
        pool: &mut BufferPool,
        settings: MeshSettings,
        roots: Vec<NodeGuid>,
    ) -> Branch {
        let pack = pool.new_pack();
        match self.free.pop() {
            Some(mut branch) => {
                self.reused += 1;
                branch.settings = settings;
                branch.roots = roots;
                branch.pack = Some(pack);
                branch.generation = branch.generation.saturating_add(1);
                tracing::trace!(branch = branch.id, generation = branch.generation, "branch reused");
                branch
            }
            None => {
                self.next_id += 1;
                self.created += 1;
                tracing::trace!(branch = self.next_id, "branch created");
                Branch::new(self.next_id, settings, roots, pack)
            }
        }
    }

    /// Restart `branch` under new settings, keeping its roots.
    ///
    /// The old pack is disposed behind the branch's outstanding jobs.
    pub fn reset(&mut self, branch: &mut Branch, pool: &mut BufferPool, settings: MeshSettings) {
        Self::dispose_pack(branch, pool);
        branch.clear();
        branch.settings = settings;
        branch.pack = Some(pool.new_pack());
        branch.generation = branch.generation.saturating_add(1);
        self.reused += 1;
    }

    /// Return `branch` to the pool.
    pub fn release(&mut self, mut branch: Branch, pool: &mut BufferPool) {
        Self::dispose_pack(&mut branch, pool);
        branch.clear();
        branch.roots.clear();
        self.free.push(branch);
    }

    /// Branches waiting for reuse.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Branches ever constructed.
    #[must_use]
    pub fn created(&self) -> u64 {
        self.created
    }

    /// Acquisitions and resets served by recycling.
    #[must_use]
    pub fn reused(&self) -> u64 {
        self.reused
    }

    fn dispose_pack(branch: &mut Branch, pool: &mut BufferPool) {
        let handle = branch.completion();
        if let Some(pack) = branch.take_pack() {
            pool.dispose(pack, handle);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
