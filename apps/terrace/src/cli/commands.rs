//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use terrace::config::{FrameConfig, TerraceConfig};
use terrace::report::{PortReport, summarize_node};
use terrace_core::{
    EvalId, EvalStatus, FlowError, Graph, NodeGuid, NodeRegistry, Session, primitives,
    snapshot_from_bytes, snapshot_to_bytes,
};
use tokio::time::MissedTickBehavior;

// =============================================================================
// FILE VALIDATION
// =============================================================================

/// Validate file size before reading.
fn validate_file_size(path: &Path, max_size: u64) -> Result<(), FlowError> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| FlowError::IoError(format!("Cannot read file metadata: {}", e)))?;

    if metadata.len() > max_size {
        return Err(FlowError::DeserializationError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            max_size
        )));
    }
    Ok(())
}

/// Resolve an input path and check it names a regular file.
fn validate_file_path(path: &Path) -> Result<PathBuf, FlowError> {
    let canonical = path.canonicalize().map_err(|e| {
        FlowError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;

    if !canonical.is_file() {
        return Err(FlowError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }

    Ok(canonical)
}

/// Resolve an output path against its (existing) parent directory.
fn validate_output_path(path: &Path) -> Result<PathBuf, FlowError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let canonical_parent = parent.canonicalize().map_err(|e| {
        FlowError::IoError(format!(
            "Invalid output directory '{}': {}",
            parent.display(),
            e
        ))
    })?;

    if !canonical_parent.is_dir() {
        return Err(FlowError::IoError(format!(
            "Output directory '{}' is not a valid directory",
            parent.display()
        )));
    }

    let filename = path
        .file_name()
        .ok_or_else(|| FlowError::IoError("Output path has no filename".to_string()))?;

    Ok(canonical_parent.join(filename))
}

fn load_config(path: &Path) -> Result<TerraceConfig, FlowError> {
    let path = validate_file_path(path)?;
    let config = TerraceConfig::load(&path)?;
    tracing::debug!(config = %path.display(), nodes = config.graph.nodes.len(), "config loaded");
    Ok(config)
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

// =============================================================================
// RUN COMMAND
// =============================================================================

/// Evaluate every root of the configured graph on a frame loop.
pub async fn cmd_run(
    config_path: &Path,
    json_mode: bool,
    verbose: bool,
    tick_ms: Option<u64>,
    max_ticks: Option<u64>,
) -> Result<(), FlowError> {
    let config = load_config(config_path)?;
    let frame = FrameConfig {
        tick_ms: tick_ms.unwrap_or(config.frame.tick_ms),
        max_ticks: max_ticks.unwrap_or(config.frame.max_ticks),
    };
    if frame.tick_ms == 0 {
        return Err(FlowError::InvalidConfig(
            "tick_ms must be positive".to_string(),
        ));
    }

    let registry = NodeRegistry::with_builtins();
    let built = config.build_graph(&registry)?;
    let labels: BTreeMap<NodeGuid, String> = built
        .ids
        .iter()
        .map(|(id, guid)| (*guid, id.clone()))
        .collect();
    let roots = built.graph.roots();
    if roots.is_empty() {
        return Err(FlowError::InvalidConfig(
            "no node is marked root = true".to_string(),
        ));
    }

    let mut session = Session::with_graph(config.session.clone(), built.graph)?;
    let id = session.evaluate(&roots, config.settings.clone())?;
    let (status, ticks) = drive(&mut session, id, frame, verbose).await?;

    let mut reports: Vec<PortReport> = Vec::new();
    if status.is_complete() {
        for root in &roots {
            let label = labels.get(root).map(String::as_str).unwrap_or("?");
            reports.extend(summarize_node(&session, id, *root, label)?);
        }
    }
    let polls = session.evaluation(id).map(|e| e.polls()).unwrap_or(0);
    let stats = session.shutdown();

    if json_mode {
        let output = serde_json::json!({
            "status": status_label(&status),
            "detail": status_detail(&status),
            "ticks": ticks,
            "polls": polls,
            "outputs": reports,
            "pool": {
                "acquired": stats.acquired,
                "reused": stats.reused,
                "released_packs": stats.released_packs,
                "deferred": stats.deferred,
                "abandoned": stats.abandoned,
                "misuse": stats.misuse
            }
        });
        print_json(&output);
    } else {
        println!("Terrace Run");
        println!("===========");
        println!("Status: {}", status_label(&status));
        if let Some(detail) = status_detail(&status) {
            println!("Detail: {}", detail);
        }
        println!("Ticks:  {}", ticks);
        println!();
        for report in &reports {
            println!(
                "  {} ({}).{}: {}",
                report.label, report.node, report.port, report.summary
            );
        }
        if !reports.is_empty() {
            println!();
        }
        println!(
            "Buffers: {} acquired, {} reused, {} deferred frees, {} misuse",
            stats.acquired, stats.reused, stats.deferred, stats.misuse
        );
        if stats.abandoned > 0 {
            println!("Abandoned: {} packs with jobs still running", stats.abandoned);
        }
    }

    match status {
        EvalStatus::Failed(err) => Err(err),
        _ => Ok(()),
    }
}

/// Tick the session until `id` settles, the tick budget runs out or the
/// user interrupts.
async fn drive(
    session: &mut Session,
    id: EvalId,
    frame: FrameConfig,
    verbose: bool,
) -> Result<(EvalStatus, u64), FlowError> {
    let mut interval = tokio::time::interval(Duration::from_millis(frame.tick_ms));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut ticks = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut ctrl_c => {
                tracing::warn!(ticks, "interrupted");
                return Ok((EvalStatus::Cancelled, ticks));
            }
        }

        ticks += 1;
        let status = session
            .tick()?
            .into_iter()
            .find(|(eval, _)| *eval == id)
            .map(|(_, status)| status)
            .ok_or(FlowError::EvaluationNotFound(id.0))?;

        if verbose {
            tracing::info!(eval = %id, tick = ticks, status = status_label(&status), "tick");
        }
        if status.is_terminal() {
            return Ok((status, ticks));
        }
        if frame.max_ticks > 0 && ticks >= frame.max_ticks {
            tracing::warn!(eval = %id, ticks, "tick budget exhausted");
            return Ok((status, ticks));
        }
    }
}

fn status_label(status: &EvalStatus) -> &'static str {
    match status {
        EvalStatus::Pending => "pending",
        EvalStatus::Complete => "complete",
        EvalStatus::Blocked(_) => "blocked",
        EvalStatus::Failed(_) => "failed",
        EvalStatus::Cancelled => "cancelled",
    }
}

fn status_detail(status: &EvalStatus) -> Option<String> {
    match status {
        EvalStatus::Blocked(diagnostic) => Some(diagnostic.to_string()),
        EvalStatus::Failed(err) => Some(err.to_string()),
        _ => None,
    }
}

// =============================================================================
// INSPECT COMMAND
// =============================================================================

/// Show the configured graph after amplification.
pub fn cmd_inspect(config_path: &Path, json_mode: bool) -> Result<(), FlowError> {
    let config = load_config(config_path)?;
    let registry = NodeRegistry::with_builtins();
    let mut built = config.build_graph(&registry)?;
    let inserted = built.graph.amplify(config.session.max_amplify_passes)?;

    print_graph(
        &built.graph,
        |guid| built.label(guid).map(str::to_string),
        inserted,
        json_mode,
    );
    Ok(())
}

fn print_graph(
    graph: &Graph,
    label: impl Fn(NodeGuid) -> Option<String>,
    inserted: usize,
    json_mode: bool,
) {
    let roots = graph.roots();

    if json_mode {
        let nodes: Vec<serde_json::Value> = graph
            .nodes()
            .map(|(guid, node)| {
                serde_json::json!({
                    "guid": guid.0,
                    "label": label(guid),
                    "kind": node.kind(),
                    "hidden": graph.is_hidden(guid),
                    "root": roots.contains(&guid),
                    "params": node.params().0
                })
            })
            .collect();
        let edges: Vec<serde_json::Value> = graph
            .edges()
            .map(|(source, input)| {
                serde_json::json!({
                    "from": source.to_string(),
                    "to": input.to_string()
                })
            })
            .collect();
        print_json(&serde_json::json!({
            "inserted": inserted,
            "nodes": nodes,
            "edges": edges
        }));
        return;
    }

    println!("Terrace Graph");
    println!("=============");
    println!(
        "Nodes: {}  Edges: {}  Inserted by amplification: {}",
        graph.node_count(),
        graph.edge_count(),
        inserted
    );
    println!();
    for (guid, node) in graph.nodes() {
        let mut flags = Vec::new();
        if roots.contains(&guid) {
            flags.push("root");
        }
        if graph.is_hidden(guid) {
            flags.push("hidden");
        }
        println!(
            "  {:<6} {:<20} {:<12} {}",
            guid.to_string(),
            node.kind(),
            label(guid).unwrap_or_default(),
            flags.join(",")
        );
    }
    println!();
    for (source, input) in graph.edges() {
        println!("  {} -> {}", source, input);
    }
}

// =============================================================================
// SNAPSHOT / RESTORE COMMANDS
// =============================================================================

/// Write the configured graph as a binary snapshot.
pub fn cmd_snapshot(config_path: &Path, output: &Path) -> Result<(), FlowError> {
    let config = load_config(config_path)?;
    let registry = NodeRegistry::with_builtins();
    let built = config.build_graph(&registry)?;

    let bytes = snapshot_to_bytes(&built.graph.snapshot())?;
    let path = validate_output_path(output)?;
    std::fs::write(&path, &bytes)
        .map_err(|e| FlowError::IoError(format!("Cannot write '{}': {}", path.display(), e)))?;

    println!(
        "Snapshot written to {:?} ({} nodes, {} bytes)",
        path,
        built.graph.node_count(),
        bytes.len()
    );
    Ok(())
}

/// Load a binary snapshot and show its graph.
pub fn cmd_restore(input: &Path, json_mode: bool) -> Result<(), FlowError> {
    let path = validate_file_path(input)?;
    validate_file_size(&path, primitives::MAX_SNAPSHOT_SIZE as u64)?;
    let bytes = std::fs::read(&path)
        .map_err(|e| FlowError::IoError(format!("Cannot read '{}': {}", path.display(), e)))?;

    let snapshot = snapshot_from_bytes(&bytes)?;
    let registry = NodeRegistry::with_builtins();
    let mut graph = Graph::from_snapshot(&registry, &snapshot)?;
    let inserted = graph.amplify(primitives::MAX_AMPLIFY_PASSES)?;
    tracing::info!(snapshot = %path.display(), nodes = graph.node_count(), "snapshot restored");

    print_graph(&graph, |_| None, inserted, json_mode);
    Ok(())
}
