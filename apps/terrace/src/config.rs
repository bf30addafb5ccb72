//! # Graph Configuration
//!
//! The driver reads one TOML file describing the session, the grid settings,
//! the frame loop and the node graph:
//!
//! ```toml
//! [session]
//! worker_threads = 4
//!
//! [settings]
//! resolution = 128
//! seed = 7
//!
//! [frame]
//! tick_ms = 16
//! max_ticks = 600
//!
//! [[graph.nodes]]
//! id = "ground"
//! kind = "height_noise"
//! params = { amplitude = 24.0, frequency = 0.02 }
//!
//! [[graph.nodes]]
//! id = "slope"
//! kind = "slope_from_normal"
//! root = true
//!
//! [[graph.edges]]
//! from = "ground.height"
//! to = "slope.normal"
//! ```
//!
//! Node ids are local to the file; the built graph maps them to guids.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use terrace_core::{
    FlowError, Graph, MeshSettings, NodeGuid, NodeParams, NodePayload, NodeRegistry, PortRef,
    SessionConfig,
};

/// Maximum config file size (1 MB).
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

// =============================================================================
// FILE LAYOUT
// =============================================================================

/// Complete driver configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TerraceConfig {
    pub session: SessionConfig,
    pub settings: MeshSettings,
    pub frame: FrameConfig,
    pub graph: GraphConfig,
}

/// Frame loop pacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FrameConfig {
    /// Milliseconds between ticks.
    pub tick_ms: u64,
    /// Ticks before `run` gives up on unfinished evaluations.
    pub max_ticks: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            tick_ms: 16,
            max_ticks: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphConfig {
    pub nodes: Vec<NodeEntry>,
    pub edges: Vec<EdgeEntry>,
}

/// One `[[graph.nodes]]` table.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeEntry {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub params: NodeParams,
    #[serde(default)]
    pub root: bool,
}

/// One `[[graph.edges]]` table; endpoints are `"id.port"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EdgeEntry {
    pub from: String,
    pub to: String,
}

// =============================================================================
// LOADING
// =============================================================================

impl TerraceConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, FlowError> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            FlowError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(FlowError::InvalidConfig(format!(
                "Config size {} bytes exceeds maximum allowed {} bytes",
                metadata.len(),
                MAX_CONFIG_FILE_SIZE
            )));
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            FlowError::IoError(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate config text.
    pub fn from_toml_str(text: &str) -> Result<Self, FlowError> {
        let config: Self =
            toml::from_str(text).map_err(|e| FlowError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        self.session.validate()?;
        self.settings.validate()?;
        if self.frame.tick_ms == 0 {
            return Err(FlowError::InvalidConfig(
                "frame.tick_ms must be positive".to_string(),
            ));
        }

        let mut seen = BTreeMap::new();
        for entry in &self.graph.nodes {
            if entry.id.is_empty() || entry.id.contains('.') {
                return Err(FlowError::InvalidConfig(format!(
                    "node id '{}' must be non-empty and contain no '.'",
                    entry.id
                )));
            }
            if seen.insert(entry.id.as_str(), ()).is_some() {
                return Err(FlowError::InvalidConfig(format!(
                    "duplicate node id '{}'",
                    entry.id
                )));
            }
        }
        for edge in &self.graph.edges {
            for endpoint in [&edge.from, &edge.to] {
                let (id, _) = split_endpoint(endpoint)?;
                if !seen.contains_key(id) {
                    return Err(FlowError::InvalidConfig(format!(
                        "edge endpoint '{endpoint}' names unknown node '{id}'"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Build the configured graph with nodes from `registry`.
    pub fn build_graph(&self, registry: &NodeRegistry) -> Result<BuiltGraph, FlowError> {
        let mut graph = Graph::new();
        let mut ids = BTreeMap::new();

        for entry in &self.graph.nodes {
            let node = registry.create(&NodePayload::new(&entry.kind, entry.params.clone()))?;
            let guid = graph.add_node(node);
            if entry.root {
                graph.set_root(guid, true)?;
            }
            tracing::debug!(id = %entry.id, kind = %entry.kind, node = %guid, "node created");
            ids.insert(entry.id.clone(), guid);
        }

        for edge in &self.graph.edges {
            let from = resolve(&ids, &edge.from)?;
            let to = resolve(&ids, &edge.to)?;
            if let Some(previous) = graph.connect(from, to)? {
                tracing::warn!(to = %edge.to, replaced = %previous, "input wired twice; last edge wins");
            }
        }

        Ok(BuiltGraph { graph, ids })
    }
}

/// A graph built from config plus the file's node ids.
#[derive(Debug)]
pub struct BuiltGraph {
    pub graph: Graph,
    pub ids: BTreeMap<String, NodeGuid>,
}

impl BuiltGraph {
    /// Config id of `guid`, if it came from the file.
    #[must_use]
    pub fn label(&self, guid: NodeGuid) -> Option<&str> {
        self.ids
            .iter()
            .find(|(_, g)| **g == guid)
            .map(|(id, _)| id.as_str())
    }
}

/// Split `"id.port"` at its first dot.
pub fn split_endpoint(endpoint: &str) -> Result<(&str, &str), FlowError> {
    match endpoint.split_once('.') {
        Some((id, port)) if !id.is_empty() && !port.is_empty() => Ok((id, port)),
        _ => Err(FlowError::InvalidConfig(format!(
            "edge endpoint '{endpoint}' is not of the form id.port"
        ))),
    }
}

fn resolve(ids: &BTreeMap<String, NodeGuid>, endpoint: &str) -> Result<PortRef, FlowError> {
    let (id, port) = split_endpoint(endpoint)?;
    let guid = ids
        .get(id)
        .ok_or_else(|| FlowError::InvalidConfig(format!("unknown node id '{id}'")))?;
    Ok(PortRef::new(*guid, port))
}
