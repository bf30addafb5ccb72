//! # Core Type Definitions
//!
//! This module contains the shared vocabulary of the evaluation core:
//! - Node and port identifiers (`NodeGuid`, `PortRef`)
//! - Port typing (`PortKind`, `PortSpec`)
//! - Per-branch grid settings (`MeshSettings`)
//! - Error types (`FlowError`)
//!
//! Identifiers implement `Ord` so graph storage can use `BTreeMap` and walk
//! order is reproducible run to run.

use crate::primitives;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Stable identity of a node within a graph.
///
/// Guids are assigned by the graph and never reused while the graph lives,
/// including guids of nodes inserted by amplification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeGuid(pub u64);

impl fmt::Display for NodeGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One end of an edge: a node guid plus a field (port) name.
///
/// Edges are keyed by `PortRef` on both ends; the input side is unique.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub node: NodeGuid,
    pub port: String,
}

impl PortRef {
    /// Create a port reference.
    #[must_use]
    pub fn new(node: NodeGuid, port: impl Into<String>) -> Self {
        Self {
            node,
            port: port.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

// =============================================================================
// PORTS
// =============================================================================

/// The kind of data flowing through a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortKind {
    /// Padded height field (`HeightMap`).
    Height,
    /// Per-cell surface normals (`NormalMap`).
    Normal,
    /// Per-cell scalar field (`ScalarMap`).
    Scalar,
    /// Placed points (`PointSet`).
    Points,
    /// Accepts anything; used by generic and test nodes.
    Any,
}

impl PortKind {
    /// Whether an output of kind `source` may feed an input of this kind.
    #[must_use]
    pub fn accepts(self, source: PortKind) -> bool {
        self == PortKind::Any || source == PortKind::Any || self == source
    }
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortKind::Height => "height",
            PortKind::Normal => "normal",
            PortKind::Scalar => "scalar",
            PortKind::Points => "points",
            PortKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// Static description of a node port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub name: &'static str,
    pub kind: PortKind,
    /// Required inputs must be connected and ready before `Process` runs.
    pub required: bool,
}

impl PortSpec {
    /// A port that must be connected.
    #[must_use]
    pub const fn required(name: &'static str, kind: PortKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    /// A port that may be left unconnected.
    #[must_use]
    pub const fn optional(name: &'static str, kind: PortKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

// =============================================================================
// MESH SETTINGS
// =============================================================================

/// Grid settings carried by an evaluation branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Cells per side of the evaluated grid.
    pub resolution: u32,
    /// World-space size of one cell.
    pub cell_size: f32,
    /// World-space position of cell (0, 0).
    pub origin: [f32; 2],
    /// Seed mixed into every procedural node.
    pub seed: u64,
    /// Extra border cells height producers generate around the grid.
    /// Derived from the graph at evaluation time.
    #[serde(skip)]
    pub padding: u32,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            resolution: primitives::DEFAULT_RESOLUTION,
            cell_size: 1.0,
            origin: [0.0, 0.0],
            seed: 0,
            padding: 0,
        }
    }
}

impl MeshSettings {
    /// Settings for a square grid of `resolution` cells at the origin.
    #[must_use]
    pub fn with_resolution(resolution: u32) -> Self {
        Self {
            resolution,
            ..Self::default()
        }
    }

    /// The same settings moved to another origin.
    #[must_use]
    pub fn at_origin(&self, origin: [f32; 2]) -> Self {
        Self {
            origin,
            ..self.clone()
        }
    }

    /// Side length of a padded grid.
    #[must_use]
    pub fn padded_size(&self) -> usize {
        (self.resolution as usize).saturating_add(2 * self.padding as usize)
    }

    /// Check the settings are usable for evaluation.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.resolution == 0 || self.resolution > primitives::MAX_RESOLUTION {
            return Err(FlowError::InvalidConfig(format!(
                "resolution {} outside 1..={}",
                self.resolution,
                primitives::MAX_RESOLUTION
            )));
        }
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err(FlowError::InvalidConfig(format!(
                "cell_size must be positive, got {}",
                self.cell_size
            )));
        }
        Ok(())
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the evaluation core.
///
/// Inputs that are not ready yet are never errors; they surface as `false`
/// or `None` and the walk retries on the next tick.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    /// The requested node is not part of the graph.
    #[error("Node not found: {0}")]
    NodeNotFound(NodeGuid),

    /// The node has no port with this name.
    #[error("Port not found: {node}.{port}")]
    PortNotFound { node: NodeGuid, port: String },

    /// An edge would connect ports of incompatible kinds.
    #[error("Port kind mismatch: {from} ({from_kind}) -> {to} ({to_kind})")]
    PortKindMismatch {
        from: PortRef,
        from_kind: PortKind,
        to: PortRef,
        to_kind: PortKind,
    },

    /// No factory is registered for this node kind.
    #[error("Unknown node kind: {0}")]
    UnknownNodeKind(String),

    /// A node parameter is out of range.
    #[error("Invalid parameter {param} for {kind}: {reason}")]
    InvalidParam {
        kind: String,
        param: String,
        reason: String,
    },

    /// A pack was released while jobs using its buffers were still running.
    #[error("Resource misuse: pack {pack} released with {outstanding} outstanding job(s)")]
    ResourceMisuse { pack: u64, outstanding: usize },

    /// A pooled buffer was accessed after its pack was released.
    #[error("Pooled buffer used after its pack was released")]
    UseAfterFree,

    /// A store key holds an instance of a different type.
    #[error("Keyed store type mismatch for key '{0}'")]
    StoreTypeMismatch(String),

    /// Amplification did not reach a fixed point.
    #[error("Amplification did not settle after {0} passes")]
    AmplificationLimit(usize),

    /// Two inputs disagree on grid size.
    #[error("Shape mismatch: expected {expected} values, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// The worker pool could not be started.
    #[error("Job runtime error: {0}")]
    RuntimeBuild(String),

    /// No live evaluation with this id.
    #[error("Evaluation not found: {0}")]
    EvaluationNotFound(u64),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// Configuration was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================
