//! # Terrace - Terrain Graph Driver
//!
//! The command-line driver for the terrace-core evaluation engine.
//!
//! This application provides:
//! - TOML graph configuration
//! - A frame loop ticking evaluations until they settle
//! - Graph inspection and binary snapshots
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                apps/terrace (THE BINARY)             │
//! │                                                      │
//! │  ┌─────────────┐   ┌─────────────┐   ┌────────────┐  │
//! │  │    CLI      │   │ Frame loop  │   │   Config   │  │
//! │  │   (clap)    │   │  (tokio)    │   │   (toml)   │  │
//! │  └──────┬──────┘   └──────┬──────┘   └─────┬──────┘  │
//! │         └─────────────────┼────────────────┘         │
//! │                           ▼                          │
//! │                  ┌────────────────┐                  │
//! │                  │  terrace-core  │                  │
//! │                  │  (THE ENGINE)  │                  │
//! │                  └────────────────┘                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! terrace -c terrain.toml run --tick-ms 16
//! terrace -c terrain.toml inspect --json-mode
//! terrace -c terrain.toml snapshot -o terrain.trrc
//! terrace restore -i terrain.trrc
//! ```

mod cli;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// APPLICATION ENTRY POINT
// =============================================================================

#[tokio::main]
async fn main() {
    // TERRACE_LOG_FORMAT=json enables machine-parseable output.
    let log_format = std::env::var("TERRACE_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "terrace=info,terrace_core=info".into());

    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    let cli = cli::Cli::parse();

    if !cli.quiet && !cli.json_mode {
        println!("terrace v{}", env!("CARGO_PKG_VERSION"));
        println!();
    }

    if let Err(e) = cli::execute(cli).await {
        tracing::error!("Error: {}", e);
        std::process::exit(1);
    }
}
