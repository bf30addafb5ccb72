//! # terrace
//!
//! Library half of the `terrace` driver: TOML graph configuration and
//! output summaries. The binary in `main.rs` adds the CLI and frame loop.

pub mod config;
pub mod report;

pub use config::{BuiltGraph, FrameConfig, TerraceConfig};
pub use report::{OutputSummary, PortReport};
