//! # Formats
//!
//! Binary encodings of core data. Pure transformations; file I/O lives in
//! the app layer.

mod payload;

pub use payload::{SnapshotHeader, snapshot_from_bytes, snapshot_to_bytes};
