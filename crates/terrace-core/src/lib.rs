//! # terrace-core
//!
//! Node-graph evaluation engine for procedural terrain.
//!
//! A graph of processing nodes is evaluated per branch (one set of mesh
//! settings) by resumable walks. Heavy work runs as jobs with explicit
//! completion handles; buffers come from a typed pool and are freed in
//! groups once the jobs using them complete.
//!
//! ## Architecture
//!
//! - `types` / `primitives`: identifiers, ports, settings, errors, limits
//! - `job`: completion handles and the worker runtime
//! - `pool`: pooled buffers grouped into packs
//! - `store`: per-session keyed singletons
//! - `node` / `nodes`: the node contract and the builtin nodes
//! - `graph`: node storage, edges and amplification
//! - `branch` / `traveller`: per-evaluation state and the resumable walk
//! - `session`: the owner tying it together, driven by ticks
//! - `formats`: binary graph snapshots
//!
//! ## Constraints
//!
//! - No async: the walk is polled on ticks, never awaited
//! - No globals: two sessions share nothing
//! - No buffer is reclaimed while a job tracked by its pack is running

// =============================================================================
// MODULES
// =============================================================================

pub mod branch;
pub mod formats;
pub mod graph;
pub mod job;
pub mod node;
pub mod nodes;
pub mod pool;
pub mod primitives;
pub mod session;
pub mod store;
pub mod traveller;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{FlowError, MeshSettings, NodeGuid, PortKind, PortRef, PortSpec};

// =============================================================================
// RE-EXPORTS: Engine
// =============================================================================

pub use branch::{Branch, BranchPool, OutputValue};
pub use graph::{Graph, GraphSnapshot, SnapshotNode};
pub use job::{JobHandle, JobRuntime, JobTrigger};
pub use node::{Amplifier, Inputs, Node, NodeTask, Outputs, ProcessContext};
pub use nodes::{NodeParams, NodePayload, NodeRegistry};
pub use pool::{BufferPool, Element, Pack, PoolStats, PooledBuffer};
pub use session::{EvalId, EvalStatus, Evaluation, Session, SessionConfig, SessionPools};
pub use store::KeyedStore;
pub use traveller::{Traveller, WalkDiagnostic, WalkEnv, WalkState, WalkStatus};

// =============================================================================
// RE-EXPORTS: Formats (from formats module)
// =============================================================================

pub use formats::{SnapshotHeader, snapshot_from_bytes, snapshot_to_bytes};
