//! # Node Graph
//!
//! Storage for node definitions and the edges between their ports.
//!
//! Edges are keyed by the input port: an input has at most one source, and
//! connecting a new source replaces the old one. All maps are `BTreeMap` so
//! iteration order, and therefore walk order, is the same on every run.
//!
//! The graph does not reject cycles. A cycle is reported by the walk when
//! it hits its depth limit.
//!
//! Node definitions are shared behind `Arc`, so cloning a graph is cheap.
//! A session hands each evaluation its own clone; edits made afterwards
//! never reach a walk already in flight.

use crate::node::{Amplifier, Node};
use crate::nodes::{NodePayload, NodeRegistry};
use crate::{FlowError, NodeGuid, PortRef};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// GRAPH IMPLEMENTATION
// =============================================================================

#[derive(Debug, Clone)]
struct NodeSlot {
    node: Arc<dyn Node>,
    /// Set once the node has run `amplify_graph` against its current inputs.
    amplified: bool,
    /// Inserted by amplification rather than by the user.
    hidden: bool,
}

/// Queued change produced while amplifying a node.
pub(crate) enum GraphEdit {
    Insert { guid: NodeGuid, node: Box<dyn Node> },
    Connect { from: PortRef, to: PortRef },
}

/// Directed graph of processing nodes.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Node storage: guid -> definition
    nodes: BTreeMap<NodeGuid, NodeSlot>,

    /// Edge table: input port -> output port feeding it
    edges: BTreeMap<PortRef, PortRef>,

    /// Nodes the user asked to evaluate by default
    roots: BTreeSet<NodeGuid>,

    /// Next guid to hand out; never decreases
    next_guid: u64,
}

impl Graph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node and return its guid.
    pub fn add_node(&mut self, node: Box<dyn Node>) -> NodeGuid {
        let guid = NodeGuid(self.next_guid);
        self.insert_slot(guid, node, false);
        guid
    }

    /// Add a node from a payload through `registry`.
    ///
    /// Keeps the payload guid when it carries one.
    pub fn create_node_from_payload(
        &mut self,
        registry: &NodeRegistry,
        payload: &NodePayload,
    ) -> Result<NodeGuid, FlowError> {
        let node = registry.create(payload)?;
        match payload.guid {
            Some(guid) if self.nodes.contains_key(&guid) => Err(FlowError::InvalidConfig(format!(
                "node guid {guid} already in use"
            ))),
            Some(guid) => {
                self.insert_slot(guid, node, false);
                Ok(guid)
            }
            None => Ok(self.add_node(node)),
        }
    }

    /// Remove a node with every edge touching it.
    ///
    /// Hidden nodes left without consumers are removed too.
    pub fn remove_node(&mut self, guid: NodeGuid) -> Result<Arc<dyn Node>, FlowError> {
        let slot = self
            .nodes
            .remove(&guid)
            .ok_or(FlowError::NodeNotFound(guid))?;

        let consumers: Vec<NodeGuid> = self
            .edges
            .iter()
            .filter(|(_, source)| source.node == guid)
            .map(|(input, _)| input.node)
            .collect();
        self.edges
            .retain(|input, source| input.node != guid && source.node != guid);
        for consumer in consumers {
            self.rearm(consumer);
        }
        self.roots.remove(&guid);
        self.prune_hidden();

        tracing::debug!(node = %guid, kind = slot.node.kind(), "node removed");
        Ok(slot.node)
    }

    /// Connect an output port to an input port.
    ///
    /// Returns the source previously feeding `to`, if any. A hidden node
    /// left without consumers by the replacement is removed.
    pub fn connect(&mut self, from: PortRef, to: PortRef) -> Result<Option<PortRef>, FlowError> {
        let previous = self.insert_edge(from, to)?;
        if previous.is_some() {
            self.prune_hidden();
        }
        Ok(previous)
    }

    fn insert_edge(&mut self, from: PortRef, to: PortRef) -> Result<Option<PortRef>, FlowError> {
        let source = self
            .nodes
            .get(&from.node)
            .ok_or(FlowError::NodeNotFound(from.node))?;
        let from_kind = source
            .node
            .output(&from.port)
            .ok_or_else(|| FlowError::PortNotFound {
                node: from.node,
                port: from.port.clone(),
            })?
            .kind;

        let target = self
            .nodes
            .get(&to.node)
            .ok_or(FlowError::NodeNotFound(to.node))?;
        let to_kind = target
            .node
            .input(&to.port)
            .ok_or_else(|| FlowError::PortNotFound {
                node: to.node,
                port: to.port.clone(),
            })?
            .kind;

        if !to_kind.accepts(from_kind) && !target.node.adapts_input(&to.port, from_kind) {
            return Err(FlowError::PortKindMismatch {
                from,
                from_kind,
                to,
                to_kind,
            });
        }

        let target = to.node;
        let previous = self.edges.insert(to, from);
        self.rearm(target);
        Ok(previous)
    }

    /// Remove the edge feeding `to`. Returns its source.
    ///
    /// A hidden node left without consumers is removed.
    pub fn disconnect(&mut self, to: &PortRef) -> Option<PortRef> {
        let previous = self.edges.remove(to);
        if previous.is_some() {
            self.rearm(to.node);
            self.prune_hidden();
        }
        previous
    }

    /// Mark or unmark a node as a default evaluation root.
    pub fn set_root(&mut self, guid: NodeGuid, root: bool) -> Result<(), FlowError> {
        if !self.nodes.contains_key(&guid) {
            return Err(FlowError::NodeNotFound(guid));
        }
        if root {
            self.roots.insert(guid);
        } else {
            self.roots.remove(&guid);
        }
        Ok(())
    }

    /// Default evaluation roots in guid order.
    #[must_use]
    pub fn roots(&self) -> Vec<NodeGuid> {
        self.roots.iter().copied().collect()
    }

    /// Node definition by guid.
    #[must_use]
    pub fn node(&self, guid: NodeGuid) -> Option<&dyn Node> {
        self.nodes.get(&guid).map(|slot| slot.node.as_ref())
    }

    /// Whether the graph holds this node.
    #[must_use]
    pub fn contains(&self, guid: NodeGuid) -> bool {
        self.nodes.contains_key(&guid)
    }

    /// Whether the node was inserted by amplification.
    #[must_use]
    pub fn is_hidden(&self, guid: NodeGuid) -> bool {
        self.nodes.get(&guid).is_some_and(|slot| slot.hidden)
    }

    /// Output port feeding `input`, if connected.
    #[must_use]
    pub fn source_of(&self, input: &PortRef) -> Option<&PortRef> {
        self.edges.get(input)
    }

    /// Nodes feeding `guid`, deduplicated, in port order.
    #[must_use]
    pub fn upstream(&self, guid: NodeGuid) -> Vec<NodeGuid> {
        let mut seen = BTreeSet::new();
        self.edges
            .range(PortRef::new(guid, "")..)
            .take_while(|(input, _)| input.node == guid)
            .filter_map(|(_, source)| seen.insert(source.node).then_some(source.node))
            .collect()
    }

    /// Nodes consuming any output of `guid`, in guid order.
    #[must_use]
    pub fn downstream(&self, guid: NodeGuid) -> Vec<NodeGuid> {
        let consumers: BTreeSet<NodeGuid> = self
            .edges
            .iter()
            .filter(|(_, source)| source.node == guid)
            .map(|(input, _)| input.node)
            .collect();
        consumers.into_iter().collect()
    }

    /// Iterator over all nodes in guid order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeGuid, &dyn Node)> + '_ {
        self.nodes
            .iter()
            .map(|(guid, slot)| (*guid, slot.node.as_ref()))
    }

    /// Iterator over all edges as (source output, target input).
    pub fn edges(&self) -> impl Iterator<Item = (&PortRef, &PortRef)> + '_ {
        self.edges.iter().map(|(input, source)| (source, input))
    }

    /// Number of nodes, hidden ones included.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Guid the next inserted node will receive.
    #[must_use]
    pub fn next_guid(&self) -> u64 {
        self.next_guid
    }

    /// Largest border any node needs around height maps.
    #[must_use]
    pub fn max_padding(&self) -> u32 {
        self.nodes
            .values()
            .map(|slot| slot.node.padding())
            .max()
            .unwrap_or(0)
    }

    /// Whether every node has been amplified against its current inputs.
    #[must_use]
    pub fn is_amplified(&self) -> bool {
        self.nodes.values().all(|slot| slot.amplified)
    }

    // =========================================================================
    // AMPLIFICATION
    // =========================================================================

    /// Run `amplify_graph` on every node not yet amplified, repeating until
    /// no node is left (newly inserted nodes get their own turn).
    ///
    /// Returns the number of nodes inserted. Fails if the graph has not
    /// settled after `max_passes` passes.
    pub fn amplify(&mut self, max_passes: usize) -> Result<usize, FlowError> {
        let mut inserted = 0;
        for pass in 0..max_passes {
            let pending: Vec<NodeGuid> = self
                .nodes
                .iter()
                .filter(|(_, slot)| !slot.amplified)
                .map(|(guid, _)| *guid)
                .collect();
            if pending.is_empty() {
                return Ok(inserted);
            }
            tracing::trace!(pass, nodes = pending.len(), "amplification pass");

            for guid in pending {
                let edits = {
                    let Some(slot) = self.nodes.get(&guid) else {
                        continue;
                    };
                    let mut amplifier = Amplifier::new(self, guid);
                    if slot.node.amplify_graph(&mut amplifier) {
                        tracing::debug!(node = %guid, kind = slot.node.kind(), "node amplified graph");
                    }
                    amplifier.into_edits()
                };
                inserted += self.apply(edits)?;
                if let Some(slot) = self.nodes.get_mut(&guid) {
                    slot.amplified = true;
                }
            }
        }

        if self.is_amplified() {
            Ok(inserted)
        } else {
            tracing::warn!(passes = max_passes, "amplification did not settle");
            Err(FlowError::AmplificationLimit(max_passes))
        }
    }

    fn apply(&mut self, edits: Vec<GraphEdit>) -> Result<usize, FlowError> {
        let mut inserted = 0;
        for edit in edits {
            match edit {
                GraphEdit::Insert { guid, node } => {
                    if self.nodes.contains_key(&guid) {
                        return Err(FlowError::InvalidConfig(format!(
                            "amplification reused guid {guid}"
                        )));
                    }
                    self.insert_slot(guid, node, true);
                    inserted += 1;
                }
                GraphEdit::Connect { from, to } => {
                    self.insert_edge(from, to)?;
                }
            }
        }
        self.prune_hidden();
        Ok(inserted)
    }

    fn insert_slot(&mut self, guid: NodeGuid, node: Box<dyn Node>, hidden: bool) {
        tracing::trace!(node = %guid, kind = node.kind(), hidden, "node inserted");
        self.nodes.insert(
            guid,
            NodeSlot {
                node: Arc::from(node),
                amplified: false,
                hidden,
            },
        );
        self.next_guid = self.next_guid.max(guid.0.saturating_add(1));
    }

    /// Force the node to amplify again against its new inputs.
    fn rearm(&mut self, guid: NodeGuid) {
        if let Some(slot) = self.nodes.get_mut(&guid) {
            slot.amplified = false;
        }
    }

    fn prune_hidden(&mut self) {
        loop {
            let orphan = self.nodes.iter().find_map(|(guid, slot)| {
                let consumed = self.edges.values().any(|source| source.node == *guid);
                (slot.hidden && !consumed).then_some(*guid)
            });
            let Some(guid) = orphan else {
                return;
            };
            self.nodes.remove(&guid);
            self.edges
                .retain(|input, source| input.node != guid && source.node != guid);
            tracing::trace!(node = %guid, "orphaned hidden node pruned");
        }
    }
}

// =============================================================================
// SERIALIZATION SUPPORT
// =============================================================================

use serde::{Deserialize, Serialize};

/// One node of a serialized graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotNode {
    pub payload: NodePayload,
    pub hidden: bool,
}

/// Serializable representation of the graph, hidden nodes included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<SnapshotNode>,
    /// (source output, target input)
    pub edges: Vec<(PortRef, PortRef)>,
    pub roots: Vec<NodeGuid>,
    pub next_guid: u64,
}

impl From<&Graph> for GraphSnapshot {
    fn from(graph: &Graph) -> Self {
        Self {
            nodes: graph
                .nodes
                .iter()
                .map(|(guid, slot)| SnapshotNode {
                    payload: NodePayload::from_node(*guid, slot.node.as_ref()),
                    hidden: slot.hidden,
                })
                .collect(),
            edges: graph
                .edges()
                .map(|(source, input)| (source.clone(), input.clone()))
                .collect(),
            roots: graph.roots(),
            next_guid: graph.next_guid,
        }
    }
}

impl Graph {
    /// Serializable copy of the graph.
    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot::from(self)
    }

    /// Rebuild a graph from a snapshot, preserving guids.
    ///
    /// Restored nodes are amplified again on the next evaluation; nodes that
    /// already have their auxiliaries wired in leave the graph unchanged.
    pub fn from_snapshot(
        registry: &NodeRegistry,
        snapshot: &GraphSnapshot,
    ) -> Result<Self, FlowError> {
        let mut graph = Graph::new();
        for entry in &snapshot.nodes {
            let guid = entry.payload.guid.ok_or_else(|| {
                FlowError::DeserializationError(format!(
                    "snapshot node of kind '{}' has no guid",
                    entry.payload.kind
                ))
            })?;
            if graph.nodes.contains_key(&guid) {
                return Err(FlowError::DeserializationError(format!(
                    "duplicate node guid {guid}"
                )));
            }
            let node = registry.create(&entry.payload)?;
            graph.insert_slot(guid, node, entry.hidden);
        }
        for (source, input) in &snapshot.edges {
            graph.connect(source.clone(), input.clone())?;
        }
        for root in &snapshot.roots {
            graph.set_root(*root, true)?;
        }
        graph.next_guid = graph.next_guid.max(snapshot.next_guid);
        Ok(graph)
    }
}

// =============================================================================
// TESTS
// =============================================================================
