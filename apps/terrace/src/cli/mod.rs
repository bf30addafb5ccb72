//! # Terrace CLI Module
//!
//! This module implements the CLI interface for Terrace.
//!
//! ## Available Commands
//!
//! - `run` - Evaluate the configured graph on a frame loop
//! - `inspect` - Show the amplified graph
//! - `snapshot` - Write the configured graph as a binary snapshot
//! - `restore` - Load a binary snapshot and show it

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use terrace_core::FlowError;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// Terrace - terrain graph evaluation driver
///
/// Builds a node graph from a TOML file and evaluates it tick by tick.
#[derive(Parser, Debug)]
#[command(name = "terrace")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the graph config
    #[arg(short, long, global = true, default_value = "terrace.toml")]
    pub config: PathBuf,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Evaluate every root on a frame loop
    Run {
        /// Milliseconds between ticks (overrides [frame].tick_ms)
        #[arg(short, long)]
        tick_ms: Option<u64>,

        /// Give up after this many ticks (overrides [frame].max_ticks)
        #[arg(short, long)]
        max_ticks: Option<u64>,
    },

    /// Show nodes and edges after amplification
    Inspect,

    /// Write the configured graph as a binary snapshot
    Snapshot {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Load a binary snapshot and show its graph
    Restore {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,
    },
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), FlowError> {
    let json_mode = cli.json_mode;

    match cli.command {
        Some(Commands::Run { tick_ms, max_ticks }) => {
            cmd_run(&cli.config, json_mode, cli.verbose, tick_ms, max_ticks).await
        }
        Some(Commands::Inspect) => cmd_inspect(&cli.config, json_mode),
        Some(Commands::Snapshot { output }) => cmd_snapshot(&cli.config, &output),
        Some(Commands::Restore { input }) => cmd_restore(&input, json_mode),
        None => {
            // No subcommand - inspect by default
            cmd_inspect(&cli.config, json_mode)
        }
    }
}
