//! # Primitives
//!
//! Fixed limits and format constants for the Terrace evaluation core.
//!
//! These values are compiled in. The limits that a session may tune are
//! only defaults here; `SessionConfig` carries the effective values.

/// Maximum number of simultaneously open checkpoints in one walk.
///
/// - Every new node entry pushes a checkpoint and increments the depth.
/// - A walk that would exceed this depth is blocked and reports failure.
/// - This bounds `TryGetInput` chains through cyclic or degenerate graphs.
pub const MAX_WALK_DEPTH: usize = 64;

/// Maximum number of amplification passes per graph compile.
///
/// Amplification runs to a fixed point; a graph that keeps inserting nodes
/// past this many passes is rejected.
pub const MAX_AMPLIFY_PASSES: usize = 16;

/// Milliseconds `Session::shutdown` waits for running jobs before it
/// abandons their packs.
pub const SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

/// Magic bytes for the Terrace graph snapshot header.
pub const MAGIC_BYTES: &[u8; 4] = b"TRRC";

/// Current snapshot format version.
///
/// Increment this when making breaking changes to the snapshot format.
pub const FORMAT_VERSION: u8 = 1;

/// Size of the snapshot header (magic + version).
pub const HEADER_SIZE: usize = 5;

/// Maximum accepted snapshot payload (16 MB).
///
/// Snapshots only carry node kinds, numeric parameters and wiring, so
/// anything larger is corrupt.
pub const MAX_SNAPSHOT_SIZE: usize = 16 * 1024 * 1024;

/// Default grid resolution (cells per side) of an evaluation branch.
pub const DEFAULT_RESOLUTION: u32 = 64;

/// Upper bound on the grid resolution a branch accepts.
pub const MAX_RESOLUTION: u32 = 4096;

/// Rows handled by one parallel job when a node splits a grid into stripes.
pub const ROWS_PER_JOB: usize = 16;
