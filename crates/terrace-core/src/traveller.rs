//! # Traveller
//!
//! Resumable depth-first walk from one root node.
//!
//! The walk never recurses on the call stack. Each visited node is a
//! `CheckPoint` frame linked to its parent; when a node cannot finish this
//! tick the chain is left in place and the next tick resumes at the same
//! frame. Popped frames are kept for reuse.
//!
//! The walk is bounded by a depth limit. A graph cycle makes the walk descend
//! forever, so hitting the limit blocks the traveller and reports the chain
//! of nodes that led there.

use crate::branch::Branch;
use crate::graph::Graph;
use crate::node::{Inputs, Outputs, ProcessContext};
use crate::pool::BufferPool;
use crate::{FlowError, JobRuntime, NodeGuid};
use std::fmt;

// =============================================================================
// WALK STATUS
// =============================================================================

/// Where a traveller is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkState {
    /// Created, not polled yet.
    Idle,
    /// Working on the given node this tick.
    Evaluating(NodeGuid),
    /// Waiting on the given node; resumes there next tick.
    Suspended(NodeGuid),
    /// The root completed.
    Terminal,
    /// The depth limit was hit along this chain.
    Blocked(WalkDiagnostic),
    /// Cancelled by its owner.
    Disabled,
}

/// Result of one `process_checkpoints` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkStatus {
    Finished,
    Pending,
    Blocked(WalkDiagnostic),
    Cancelled,
}

/// The chain of nodes that exceeded the depth limit, root first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkDiagnostic {
    pub chain: Vec<NodeGuid>,
    pub limit: usize,
}

impl fmt::Display for WalkDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "walk depth limit {} exceeded:", self.limit)?;
        for (i, node) in self.chain.iter().enumerate() {
            let sep = if i == 0 { " " } else { " -> " };
            write!(f, "{sep}{node}")?;
        }
        Ok(())
    }
}

/// Shared resources a walk needs besides the graph and its branch.
pub struct WalkEnv<'a> {
    pub runtime: &'a JobRuntime,
    pub pool: &'a mut BufferPool,
}

// =============================================================================
// CHECKPOINTS
// =============================================================================

#[derive(Debug)]
struct CheckPoint {
    node: NodeGuid,
    parent: Option<Box<CheckPoint>>,
}

/// Outcome of visiting one node.
enum Step {
    /// Node completed and its outputs are cached.
    Done,
    /// An input comes from this node, which has not run yet.
    NeedsInput(NodeGuid),
    /// Inputs missing with nothing to descend into.
    NotReady,
    /// `process` returned `false`; try again next tick.
    Pending,
}

impl CheckPoint {
    fn process_node(
        &self,
        graph: &Graph,
        branch: &mut Branch,
        env: &mut WalkEnv<'_>,
    ) -> Result<Step, FlowError> {
        let guid = self.node;
        if branch.is_completed(guid) {
            return Ok(Step::Done);
        }
        let node = graph.node(guid).ok_or(FlowError::NodeNotFound(guid))?;

        let mut task = match branch.take_task(guid) {
            Some(task) => task,
            None => {
                tracing::trace!(node = %guid, kind = node.kind(), "task created");
                node.create_task(branch.settings())
            }
        };

        let (ready, upstream) = {
            let mut inputs = Inputs::new(graph, branch, guid);
            let ready = task.set_input_values(&mut inputs);
            if !ready && !inputs.disconnected().is_empty() {
                tracing::debug!(node = %guid, ports = ?inputs.disconnected(), "inputs not connected");
            }
            (ready, inputs.pending_upstream())
        };
        if !ready {
            branch.park_task(guid, task);
            return Ok(match upstream {
                Some(upstream) => Step::NeedsInput(upstream),
                None => Step::NotReady,
            });
        }

        let done = {
            let (settings, pack) = branch.process_parts(env.pool);
            let mut ctx = ProcessContext::new(guid, settings, env.runtime, env.pool, pack);
            task.process(&mut ctx)?
        };
        if !done {
            branch.park_task(guid, task);
            return Ok(Step::Pending);
        }

        let mut outputs = Outputs::new(guid, node.outputs(), branch.outputs_mut());
        task.cache_output_values(&mut outputs);
        branch.mark_completed(guid);
        tracing::trace!(node = %guid, "node completed");
        Ok(Step::Done)
    }
}

// =============================================================================
// TRAVELLER
// =============================================================================

/// Resumable walk evaluating one root inside one branch.
#[derive(Debug)]
pub struct Traveller {
    root: NodeGuid,
    current: Option<Box<CheckPoint>>,
    depth: usize,
    max_depth: usize,
    spare: Vec<Box<CheckPoint>>,
    state: WalkState,
    visits: u64,
}

impl Traveller {
    /// A walk from `root` that blocks beyond `max_depth` frames.
    #[must_use]
    pub fn new(root: NodeGuid, max_depth: usize) -> Self {
        Self {
            root,
            current: None,
            depth: 0,
            max_depth,
            spare: Vec::new(),
            state: WalkState::Idle,
            visits: 0,
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeGuid {
        self.root
    }

    #[must_use]
    pub fn state(&self) -> &WalkState {
        &self.state
    }

    /// Frames currently on the chain.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Total frames pushed over the walk's life.
    #[must_use]
    pub fn visits(&self) -> u64 {
        self.visits
    }

    /// Frames kept for reuse.
    #[must_use]
    pub fn spare_frames(&self) -> usize {
        self.spare.len()
    }

    /// Advance the walk as far as it can go this tick.
    ///
    /// Returns `Pending` when a node is waiting on a job or on inputs; call
    /// again on a later tick. Errors from a node's `process` abort the walk.
    pub fn process_checkpoints(
        &mut self,
        graph: &Graph,
        branch: &mut Branch,
        env: &mut WalkEnv<'_>,
    ) -> Result<WalkStatus, FlowError> {
        match &self.state {
            WalkState::Disabled => return Ok(WalkStatus::Cancelled),
            WalkState::Terminal => return Ok(WalkStatus::Finished),
            WalkState::Blocked(diagnostic) => return Ok(WalkStatus::Blocked(diagnostic.clone())),
            WalkState::Idle | WalkState::Evaluating(_) | WalkState::Suspended(_) => {}
        }

        if self.current.is_none() {
            if branch.is_completed(self.root) {
                self.state = WalkState::Terminal;
                return Ok(WalkStatus::Finished);
            }
            if let Err(diagnostic) = self.new_checkpoint(self.root) {
                return Ok(self.block(diagnostic));
            }
        }

        loop {
            let Some(frame) = self.current.as_deref() else {
                self.state = WalkState::Terminal;
                tracing::debug!(root = %self.root, visits = self.visits, "walk finished");
                return Ok(WalkStatus::Finished);
            };
            let node = frame.node;
            self.state = WalkState::Evaluating(node);

            let step = match frame.process_node(graph, branch, env) {
                Ok(step) => step,
                Err(err) => {
                    tracing::error!(root = %self.root, node = %node, error = %err, "node failed");
                    self.disable();
                    return Err(err);
                }
            };

            match step {
                Step::Done => self.pop_checkpoint(),
                Step::NeedsInput(upstream) => {
                    if let Err(diagnostic) = self.new_checkpoint(upstream) {
                        return Ok(self.block(diagnostic));
                    }
                }
                Step::NotReady | Step::Pending => {
                    self.state = WalkState::Suspended(node);
                    return Ok(WalkStatus::Pending);
                }
            }
        }
    }

    /// Cancel the walk. Later calls report `Cancelled`.
    pub fn disable(&mut self) {
        self.release_frames();
        self.state = WalkState::Disabled;
    }

    fn new_checkpoint(&mut self, node: NodeGuid) -> Result<(), WalkDiagnostic> {
        if self.depth >= self.max_depth {
            return Err(self.diagnostic(node));
        }
        let frame = match self.spare.pop() {
            Some(mut frame) => {
                frame.node = node;
                frame.parent = self.current.take();
                frame
            }
            None => Box::new(CheckPoint {
                node,
                parent: self.current.take(),
            }),
        };
        self.current = Some(frame);
        self.depth += 1;
        self.visits += 1;
        tracing::trace!(node = %node, depth = self.depth, "checkpoint pushed");
        Ok(())
    }

    fn pop_checkpoint(&mut self) {
        if let Some(mut frame) = self.current.take() {
            self.current = frame.parent.take();
            self.depth = self.depth.saturating_sub(1);
            self.spare.push(frame);
        }
    }

    /// Unlinks frames one at a time so a long chain is never dropped recursively.
    fn release_frames(&mut self) {
        while self.current.is_some() {
            self.pop_checkpoint();
        }
    }

    fn diagnostic(&self, next: NodeGuid) -> WalkDiagnostic {
        let mut chain = Vec::with_capacity(self.depth + 1);
        let mut frame = self.current.as_deref();
        while let Some(checkpoint) = frame {
            chain.push(checkpoint.node);
            frame = checkpoint.parent.as_deref();
        }
        chain.reverse();
        chain.push(next);
        WalkDiagnostic {
            chain,
            limit: self.max_depth,
        }
    }

    fn block(&mut self, diagnostic: WalkDiagnostic) -> WalkStatus {
        tracing::warn!(root = %self.root, %diagnostic, "walk blocked");
        self.release_frames();
        self.state = WalkState::Blocked(diagnostic.clone());
        WalkStatus::Blocked(diagnostic)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::branch::BranchPool;
    use crate::nodes::{BlendHeights, HeightMap, HeightNoise};
    use crate::{MeshSettings, PortRef};

    fn blend_chain() -> (Graph, NodeGuid) {
        let mut graph = Graph::new();
        let a = graph.add_node(Box::new(HeightNoise::new(4.0, 0.1)));
        let b = graph.add_node(Box::new(HeightNoise::new(2.0, 0.3)));
        let blend = graph.add_node(Box::new(BlendHeights::new(0.5)));
        graph
            .connect(PortRef::new(a, "height"), PortRef::new(blend, "a"))
            .expect("connect a");
        graph
            .connect(PortRef::new(b, "height"), PortRef::new(blend, "b"))
            .expect("connect b");
        (graph, blend)
    }

    #[test]
    fn inline_walk_finishes_in_one_tick() {
        let (graph, root) = blend_chain();
        let runtime = JobRuntime::inline();
        let mut pool = BufferPool::new();
        let mut branches = BranchPool::new();
        let mut branch = branches.acquire(&mut pool, MeshSettings::with_resolution(8), vec![root]);
        let mut env = WalkEnv {
            runtime: &runtime,
            pool: &mut pool,
        };

        let mut traveller = Traveller::new(root, 16);
        let status = traveller
            .process_checkpoints(&graph, &mut branch, &mut env)
            .expect("walk");

        assert_eq!(status, WalkStatus::Finished);
        assert_eq!(traveller.state(), &WalkState::Terminal);
        assert_eq!(traveller.depth(), 0);
        assert_eq!(branch.completed_count(), 3);
        assert!(branch.try_get_output_data::<HeightMap>(root, "height").is_some());
    }

    #[test]
    fn frames_are_reused() {
        let (graph, root) = blend_chain();
        let runtime = JobRuntime::inline();
        let mut pool = BufferPool::new();
        let mut branches = BranchPool::new();
        let mut branch = branches.acquire(&mut pool, MeshSettings::with_resolution(4), vec![root]);
        let mut env = WalkEnv {
            runtime: &runtime,
            pool: &mut pool,
        };

        let mut traveller = Traveller::new(root, 16);
        traveller
            .process_checkpoints(&graph, &mut branch, &mut env)
            .expect("walk");

        // root, a, b pushed; b reuses the frame a left behind
        assert_eq!(traveller.visits(), 3);
        assert_eq!(traveller.spare_frames(), 2);
    }

    #[test]
    fn depth_limit_blocks_with_chain() {
        let (graph, root) = blend_chain();
        let runtime = JobRuntime::inline();
        let mut pool = BufferPool::new();
        let mut branches = BranchPool::new();
        let mut branch = branches.acquire(&mut pool, MeshSettings::with_resolution(4), vec![root]);
        let mut env = WalkEnv {
            runtime: &runtime,
            pool: &mut pool,
        };

        let mut traveller = Traveller::new(root, 1);
        let status = traveller
            .process_checkpoints(&graph, &mut branch, &mut env)
            .expect("walk");

        let WalkStatus::Blocked(diagnostic) = status else {
            panic!("expected blocked walk, got {status:?}");
        };
        assert_eq!(diagnostic.chain, vec![root, NodeGuid(0)]);
        assert_eq!(diagnostic.limit, 1);
        assert_eq!(traveller.state(), &WalkState::Blocked(diagnostic.clone()));
        assert!(diagnostic.to_string().contains("n2 -> n0"));

        // later polls report the same chain without walking again
        let again = traveller
            .process_checkpoints(&graph, &mut branch, &mut env)
            .expect("walk");
        assert_eq!(again, WalkStatus::Blocked(diagnostic));
        assert_eq!(traveller.visits(), 1);
    }

    #[test]
    fn disabled_walk_reports_cancelled() {
        let (graph, root) = blend_chain();
        let runtime = JobRuntime::inline();
        let mut pool = BufferPool::new();
        let mut branches = BranchPool::new();
        let mut branch = branches.acquire(&mut pool, MeshSettings::with_resolution(4), vec![root]);
        let mut env = WalkEnv {
            runtime: &runtime,
            pool: &mut pool,
        };

        let mut traveller = Traveller::new(root, 16);
        traveller.disable();

        let status = traveller
            .process_checkpoints(&graph, &mut branch, &mut env)
            .expect("walk");
        assert_eq!(status, WalkStatus::Cancelled);
        assert_eq!(branch.completed_count(), 0);
    }
}
