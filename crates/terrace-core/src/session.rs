//! # Session Management
//!
//! A `Session` owns everything one host needs to evaluate a graph:
//! - the `Graph`
//! - a `KeyedStore` holding the buffer and branch pools
//! - the `JobRuntime`
//! - the live evaluations, each with its own branch and travellers
//!
//! Nothing is global: two sessions in one process share no state.
//!
//! Evaluations are driven by ticks. `tick` polls every live evaluation once
//! and never blocks. `shutdown` waits for outstanding jobs for at most
//! `shutdown_timeout_ms`, then abandons whatever is still running.
//!
//! Each evaluation walks the graph as it was when the evaluation started (or
//! was last restarted). Later edits through `graph_mut` do not affect it.

use crate::branch::{Branch, BranchPool};
use crate::graph::Graph;
use crate::pool::{BufferPool, PoolStats};
use crate::primitives;
use crate::store::KeyedStore;
use crate::traveller::{Traveller, WalkDiagnostic, WalkEnv, WalkStatus};
use crate::{FlowError, JobRuntime, MeshSettings, NodeGuid};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Store key of the session pools.
pub const POOLS_KEY: &str = "session.pools";

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Session tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Walk frames before a traveller blocks.
    pub max_walk_depth: usize,
    /// Worker threads; 0 runs every job inline on the ticking thread.
    pub worker_threads: usize,
    pub max_amplify_passes: usize,
    /// How long `shutdown` waits for running jobs before abandoning them.
    pub shutdown_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_walk_depth: primitives::MAX_WALK_DEPTH,
            worker_threads: std::thread::available_parallelism()
                .map(std::num::NonZero::get)
                .unwrap_or(1),
            max_amplify_passes: primitives::MAX_AMPLIFY_PASSES,
            shutdown_timeout_ms: primitives::SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    /// Default limits with jobs run inline.
    #[must_use]
    pub fn inline() -> Self {
        Self {
            worker_threads: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.max_walk_depth == 0 {
            return Err(FlowError::InvalidConfig(
                "max_walk_depth must be positive".to_string(),
            ));
        }
        if self.max_amplify_passes == 0 {
            return Err(FlowError::InvalidConfig(
                "max_amplify_passes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Buffer and branch pools shared by a session's evaluations.
#[derive(Debug, Default)]
pub struct SessionPools {
    pub buffers: BufferPool,
    pub branches: BranchPool,
}

// =============================================================================
// EVALUATION
// =============================================================================

/// Identifier of a live evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EvalId(pub u64);

impl fmt::Display for EvalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Where an evaluation stands.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalStatus {
    Pending,
    Complete,
    Blocked(WalkDiagnostic),
    Failed(FlowError),
    Cancelled,
}

impl EvalStatus {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, EvalStatus::Complete)
    }

    /// Whether polling can no longer change the status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EvalStatus::Pending)
    }
}

/// One evaluation: a graph snapshot, a branch and one traveller per root.
#[derive(Debug)]
pub struct Evaluation {
    id: EvalId,
    graph: Arc<Graph>,
    branch: Option<Branch>,
    travellers: Vec<Traveller>,
    status: EvalStatus,
    polls: u64,
    max_depth: usize,
}

impl Evaluation {
    fn new(id: EvalId, graph: Arc<Graph>, branch: Branch, max_depth: usize) -> Self {
        let travellers = Self::travellers_for(&branch, max_depth);
        Self {
            id,
            graph,
            branch: Some(branch),
            travellers,
            status: EvalStatus::Pending,
            polls: 0,
            max_depth,
        }
    }

    fn travellers_for(branch: &Branch, max_depth: usize) -> Vec<Traveller> {
        branch
            .roots()
            .iter()
            .map(|root| Traveller::new(*root, max_depth))
            .collect()
    }

    #[must_use]
    pub fn id(&self) -> EvalId {
        self.id
    }

    #[must_use]
    pub fn status(&self) -> &EvalStatus {
        &self.status
    }

    /// Ticks spent so far.
    #[must_use]
    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// The graph this evaluation walks.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    #[must_use]
    pub fn branch(&self) -> Option<&Branch> {
        self.branch.as_ref()
    }

    #[must_use]
    pub fn travellers(&self) -> &[Traveller] {
        &self.travellers
    }

    /// Advance every traveller once.
    pub fn poll(&mut self, runtime: &JobRuntime, pool: &mut BufferPool) -> EvalStatus {
        if self.status.is_terminal() {
            return self.status.clone();
        }
        let Some(branch) = self.branch.as_mut() else {
            self.status = EvalStatus::Cancelled;
            return self.status.clone();
        };
        self.polls += 1;

        let mut env = WalkEnv { runtime, pool };
        let mut all_finished = true;
        let mut outcome = None;
        for traveller in &mut self.travellers {
            match traveller.process_checkpoints(&self.graph, branch, &mut env) {
                Ok(WalkStatus::Finished) => {}
                Ok(WalkStatus::Pending) => all_finished = false,
                Ok(WalkStatus::Blocked(diagnostic)) => {
                    outcome = Some(EvalStatus::Blocked(diagnostic));
                    break;
                }
                Ok(WalkStatus::Cancelled) => {
                    outcome = Some(EvalStatus::Cancelled);
                    break;
                }
                Err(err) => {
                    outcome = Some(EvalStatus::Failed(err));
                    break;
                }
            }
        }

        if let Some(status) = outcome {
            for traveller in &mut self.travellers {
                traveller.disable();
            }
            tracing::warn!(eval = %self.id, status = ?status, polls = self.polls, "evaluation stopped");
            self.status = status;
        } else if all_finished {
            tracing::info!(eval = %self.id, polls = self.polls, "evaluation complete");
            self.status = EvalStatus::Complete;
        }
        self.status.clone()
    }

    /// Poll once and report whether the evaluation is complete.
    pub fn evaluate(&mut self, runtime: &JobRuntime, pool: &mut BufferPool) -> bool {
        self.poll(runtime, pool).is_complete()
    }

    /// Stop walking. Outputs already cached stay readable.
    pub fn cancel(&mut self) {
        for traveller in &mut self.travellers {
            traveller.disable();
        }
        if !self.status.is_terminal() {
            self.status = EvalStatus::Cancelled;
        }
    }

    fn restart(&mut self, graph: Arc<Graph>, pools: &mut SessionPools, settings: MeshSettings) {
        self.graph = graph;
        if let Some(branch) = self.branch.as_mut() {
            pools.branches.reset(branch, &mut pools.buffers, settings);
            self.travellers = Self::travellers_for(branch, self.max_depth);
        }
        self.status = EvalStatus::Pending;
        self.polls = 0;
    }

    fn take_branch(&mut self) -> Option<Branch> {
        self.branch.take()
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Owner of a graph and its evaluations.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    graph: Arc<Graph>,
    store: KeyedStore,
    runtime: JobRuntime,
    evaluations: BTreeMap<EvalId, Evaluation>,
    next_eval: u64,
}

impl Session {
    /// Session over an empty graph.
    pub fn new(config: SessionConfig) -> Result<Self, FlowError> {
        Self::with_graph(config, Graph::new())
    }

    /// Session over an existing graph.
    pub fn with_graph(config: SessionConfig, graph: Graph) -> Result<Self, FlowError> {
        config.validate()?;
        let runtime = JobRuntime::new(config.worker_threads)?;
        tracing::info!(
            workers = runtime.workers(),
            max_walk_depth = config.max_walk_depth,
            "session started"
        );
        Ok(Self {
            config,
            graph: Arc::new(graph),
            store: KeyedStore::new(),
            runtime,
            evaluations: BTreeMap::new(),
            next_eval: 0,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Mutable graph access. Edits apply to evaluations started (or
    /// restarted) afterwards; live evaluations keep walking their own copy.
    pub fn graph_mut(&mut self) -> &mut Graph {
        Arc::make_mut(&mut self.graph)
    }

    #[must_use]
    pub fn runtime(&self) -> &JobRuntime {
        &self.runtime
    }

    #[must_use]
    pub fn store(&self) -> &KeyedStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut KeyedStore {
        &mut self.store
    }

    /// Start evaluating `roots` under `settings`.
    ///
    /// Amplifies the graph first, then derives the border padding from the
    /// amplified graph. The evaluation makes progress on `tick` or `poll`.
    pub fn evaluate(&mut self, roots: &[NodeGuid], settings: MeshSettings) -> Result<EvalId, FlowError> {
        settings.validate()?;
        if roots.is_empty() {
            return Err(FlowError::InvalidConfig("no roots to evaluate".to_string()));
        }
        for root in roots {
            if !self.graph.contains(*root) {
                return Err(FlowError::NodeNotFound(*root));
            }
        }

        let inserted = self.amplify()?;
        let settings = self.padded(settings);

        let pools = self.store.get_or_create::<SessionPools>(POOLS_KEY)?;
        let branch = pools
            .branches
            .acquire(&mut pools.buffers, settings, roots.to_vec());

        self.next_eval += 1;
        let id = EvalId(self.next_eval);
        tracing::info!(eval = %id, roots = roots.len(), inserted, branch = branch.id(), "evaluation started");
        let evaluation = Evaluation::new(id, Arc::clone(&self.graph), branch, self.config.max_walk_depth);
        self.evaluations.insert(id, evaluation);
        Ok(id)
    }

    /// Advance one evaluation by one tick.
    pub fn poll(&mut self, id: EvalId) -> Result<EvalStatus, FlowError> {
        let pools = self.store.get_or_create::<SessionPools>(POOLS_KEY)?;
        pools.buffers.collect();
        let evaluation = self
            .evaluations
            .get_mut(&id)
            .ok_or(FlowError::EvaluationNotFound(id.0))?;
        Ok(evaluation.poll(&self.runtime, &mut pools.buffers))
    }

    /// Advance every unfinished evaluation by one tick and report all
    /// statuses in id order.
    pub fn tick(&mut self) -> Result<Vec<(EvalId, EvalStatus)>, FlowError> {
        let pools = self.store.get_or_create::<SessionPools>(POOLS_KEY)?;
        let freed = pools.buffers.collect();
        if freed > 0 {
            tracing::debug!(freed, "deferred buffers reclaimed");
        }
        let statuses = self
            .evaluations
            .values_mut()
            .map(|evaluation| {
                let status = evaluation.poll(&self.runtime, &mut pools.buffers);
                (evaluation.id(), status)
            })
            .collect();
        Ok(statuses)
    }

    /// Current status without polling.
    #[must_use]
    pub fn status(&self, id: EvalId) -> Option<EvalStatus> {
        self.evaluations.get(&id).map(|e| e.status().clone())
    }

    #[must_use]
    pub fn evaluation(&self, id: EvalId) -> Option<&Evaluation> {
        self.evaluations.get(&id)
    }

    /// Ids of live evaluations.
    #[must_use]
    pub fn evaluations(&self) -> Vec<EvalId> {
        self.evaluations.keys().copied().collect()
    }

    /// Finished output of `field` on `node` in evaluation `id`.
    #[must_use]
    pub fn try_get_output_data<T: Any + Send + Sync>(
        &self,
        id: EvalId,
        node: NodeGuid,
        field: &str,
    ) -> Option<Arc<T>> {
        self.evaluations
            .get(&id)?
            .branch()?
            .try_get_output_data(node, field)
    }

    /// Restart evaluation `id` under new settings on the current graph,
    /// reusing its branch.
    pub fn reevaluate(&mut self, id: EvalId, settings: MeshSettings) -> Result<(), FlowError> {
        settings.validate()?;
        if !self.evaluations.contains_key(&id) {
            return Err(FlowError::EvaluationNotFound(id.0));
        }
        self.amplify()?;
        let settings = self.padded(settings);
        let graph = Arc::clone(&self.graph);

        let pools = self.store.get_or_create::<SessionPools>(POOLS_KEY)?;
        let evaluation = self
            .evaluations
            .get_mut(&id)
            .ok_or(FlowError::EvaluationNotFound(id.0))?;
        evaluation.cancel();
        evaluation.restart(graph, pools, settings);
        tracing::info!(eval = %id, "evaluation restarted");
        Ok(())
    }

    /// Drop evaluation `id`. Its buffers are freed once its jobs finish.
    pub fn release(&mut self, id: EvalId) -> Result<(), FlowError> {
        let mut evaluation = self
            .evaluations
            .remove(&id)
            .ok_or(FlowError::EvaluationNotFound(id.0))?;
        evaluation.cancel();
        if let Some(branch) = evaluation.take_branch() {
            let pools = self.store.get_or_create::<SessionPools>(POOLS_KEY)?;
            pools.branches.release(branch, &mut pools.buffers);
        }
        tracing::debug!(eval = %id, "evaluation released");
        Ok(())
    }

    /// Buffer pool counters, once any evaluation has started.
    #[must_use]
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.store
            .get::<SessionPools>(POOLS_KEY)
            .map(|pools| pools.buffers.stats())
    }

    /// Release every evaluation and free all buffers.
    ///
    /// Waits at most `shutdown_timeout_ms` for running jobs. Packs whose
    /// jobs are still running after that are abandoned, not freed.
    pub fn shutdown(mut self) -> PoolStats {
        let ids = self.evaluations();
        for id in ids {
            if let Err(err) = self.release(id) {
                tracing::warn!(eval = %id, error = %err, "release during shutdown failed");
            }
        }
        let Some(mut pools) = self.store.remove::<SessionPools>(POOLS_KEY) else {
            return PoolStats::default();
        };
        pools.buffers.collect();
        if pools.buffers.pending_releases() > 0 {
            let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);
            if !pools.buffers.pending_completion().wait_timeout(timeout) {
                tracing::warn!(
                    packs = pools.buffers.pending_releases(),
                    timeout_ms = self.config.shutdown_timeout_ms,
                    "jobs still running at shutdown"
                );
            }
            pools.buffers.collect();
            pools.buffers.abandon_pending();
        }
        let stats = pools.buffers.stats();
        tracing::info!(
            released_packs = stats.released_packs,
            abandoned = stats.abandoned,
            misuse = stats.misuse,
            "session shut down"
        );
        stats
    }

    /// Amplify the session graph unless it already is.
    fn amplify(&mut self) -> Result<usize, FlowError> {
        if self.graph.is_amplified() {
            return Ok(0);
        }
        Arc::make_mut(&mut self.graph).amplify(self.config.max_amplify_passes)
    }

    fn padded(&self, mut settings: MeshSettings) -> MeshSettings {
        settings.padding = self.graph.max_padding();
        settings
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{HeightMap, HeightNoise, PointSet, ScalarMap, ScatterPoints, SlopeFromNormal};
    use crate::PortRef;

    fn slope_session() -> (Session, NodeGuid, NodeGuid) {
        let mut session = Session::new(SessionConfig::inline()).expect("session");
        let graph = session.graph_mut();
        let height = graph.add_node(Box::new(HeightNoise::new(20.0, 0.05)));
        let slope = graph.add_node(Box::new(SlopeFromNormal));
        graph
            .connect(PortRef::new(height, "height"), PortRef::new(slope, "normal"))
            .expect("connect");
        (session, height, slope)
    }

    #[test]
    fn config_validation() {
        assert!(SessionConfig::default().validate().is_ok());
        let zero = SessionConfig {
            max_walk_depth: 0,
            ..SessionConfig::inline()
        };
        assert!(Session::new(zero).is_err());
    }

    #[test]
    fn evaluate_amplifies_and_pads() {
        let (mut session, height, slope) = slope_session();
        let id = session
            .evaluate(&[slope], MeshSettings::with_resolution(8))
            .expect("evaluate");

        assert_eq!(session.graph().node_count(), 3);
        let status = session.poll(id).expect("poll");
        assert_eq!(status, EvalStatus::Complete);

        let map = session
            .try_get_output_data::<HeightMap>(id, height, "height")
            .expect("height");
        assert_eq!(map.padding, 1);
        assert_eq!(map.values.len(), 10 * 10);

        let slopes = session
            .try_get_output_data::<ScalarMap>(id, slope, "slope")
            .expect("slope");
        assert_eq!(slopes.values.len(), 64);
        let slopes = slopes.values.to_vec().expect("read");
        assert!(slopes.iter().all(|s| (0.0..=90.0).contains(s)));
    }

    #[test]
    fn unknown_root_is_rejected() {
        let (mut session, _, _) = slope_session();
        assert_eq!(
            session.evaluate(&[NodeGuid(42)], MeshSettings::default()),
            Err(FlowError::NodeNotFound(NodeGuid(42)))
        );
        assert!(session.evaluate(&[], MeshSettings::default()).is_err());
    }

    #[test]
    fn release_returns_branch_and_buffers() {
        let (mut session, _, slope) = slope_session();
        let id = session
            .evaluate(&[slope], MeshSettings::with_resolution(4))
            .expect("evaluate");
        session.poll(id).expect("poll");

        session.release(id).expect("release");

        assert_eq!(session.status(id), None);
        let stats = session.pool_stats().expect("stats");
        assert_eq!(stats.released_packs, 1);
        assert_eq!(stats.misuse, 0);
        assert_eq!(session.release(id), Err(FlowError::EvaluationNotFound(id.0)));
    }

    #[test]
    fn reevaluate_reuses_branch_with_new_settings() {
        let (mut session, height, slope) = slope_session();
        let id = session
            .evaluate(&[slope], MeshSettings::with_resolution(4))
            .expect("evaluate");
        session.poll(id).expect("poll");

        session
            .reevaluate(id, MeshSettings::with_resolution(6).at_origin([100.0, 0.0]))
            .expect("reevaluate");
        assert_eq!(session.status(id), Some(EvalStatus::Pending));
        assert_eq!(session.poll(id).expect("poll"), EvalStatus::Complete);

        let map = session
            .try_get_output_data::<HeightMap>(id, height, "height")
            .expect("height");
        assert_eq!(map.resolution, 6);
        let branch = session
            .evaluation(id)
            .and_then(Evaluation::branch)
            .expect("branch");
        assert_eq!(branch.generation(), 1);
    }

    #[test]
    fn graph_edits_leave_live_evaluations_alone() {
        let mut session = Session::new(SessionConfig::inline()).expect("session");
        let graph = session.graph_mut();
        let height = graph.add_node(Box::new(HeightNoise::new(5.0, 0.1)));
        let scatter = graph.add_node(Box::new(ScatterPoints {
            density: 1.0,
            rows_per_tick: 2,
            ..ScatterPoints::default()
        }));
        let scatter_in = PortRef::new(scatter, "height");
        graph
            .connect(PortRef::new(height, "height"), scatter_in.clone())
            .expect("connect");

        let id = session
            .evaluate(&[scatter], MeshSettings::with_resolution(8))
            .expect("evaluate");
        assert_eq!(session.poll(id).expect("poll"), EvalStatus::Pending);

        session.graph_mut().disconnect(&scatter_in).expect("was connected");
        assert_eq!(session.graph().edge_count(), 0);

        let mut status = EvalStatus::Pending;
        for _ in 0..8 {
            status = session.poll(id).expect("poll");
            if status.is_terminal() {
                break;
            }
        }
        assert_eq!(status, EvalStatus::Complete);
        let points = session
            .try_get_output_data::<PointSet>(id, scatter, "points")
            .expect("points");
        assert_eq!(points.points.len(), 64);
        assert_eq!(session.evaluation(id).map(|e| e.graph().edge_count()), Some(1));

        // a restart walks the edited graph
        session
            .reevaluate(id, MeshSettings::with_resolution(8))
            .expect("reevaluate");
        assert_eq!(session.poll(id).expect("poll"), EvalStatus::Pending);
        assert_eq!(session.evaluation(id).map(|e| e.graph().edge_count()), Some(0));
    }

    #[test]
    fn sessions_are_independent() {
        let (mut first, _, first_slope) = slope_session();
        let (mut second, _, _) = slope_session();

        first
            .evaluate(&[first_slope], MeshSettings::with_resolution(4))
            .expect("evaluate");
        first.tick().expect("tick");

        assert!(second.tick().expect("tick").is_empty());
        assert!(second.pool_stats().is_some());
        assert_eq!(second.pool_stats().map(|s| s.acquired), Some(0));
    }

    #[test]
    fn shutdown_frees_everything() {
        let (mut session, _, slope) = slope_session();
        session
            .evaluate(&[slope], MeshSettings::with_resolution(4))
            .expect("evaluate");
        session.tick().expect("tick");

        let stats = session.shutdown();
        assert_eq!(stats.released_packs, 1);
        assert_eq!(stats.released_buffers, stats.acquired);
    }
}
