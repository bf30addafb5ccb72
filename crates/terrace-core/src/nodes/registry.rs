//! Node construction by kind name, for snapshots and config files.

use super::{BlendHeights, HeightNoise, NormalFromHeight, ScatterPoints, SlopeFromNormal};
use crate::node::Node;
use crate::{FlowError, NodeGuid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// PARAMETERS
// =============================================================================

/// Numeric node parameters by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeParams(pub BTreeMap<String, f64>);

impl NodeParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// `name` as `f32`, or `default` when absent. Rejects non-finite values.
    pub fn f32_or(&self, kind: &str, name: &str, default: f32) -> Result<f32, FlowError> {
        match self.get(name) {
            None => Ok(default),
            Some(value) if value.is_finite() => Ok(value as f32),
            Some(value) => Err(invalid(kind, name, format!("{value} is not finite"))),
        }
    }

    /// `name` as a non-negative integer, or `default` when absent.
    pub fn u64_or(&self, kind: &str, name: &str, default: u64) -> Result<u64, FlowError> {
        match self.get(name) {
            None => Ok(default),
            Some(value) if value >= 0.0 && value.fract() == 0.0 && value <= u64::MAX as f64 => {
                Ok(value as u64)
            }
            Some(value) => Err(invalid(kind, name, format!("{value} is not a non-negative integer"))),
        }
    }
}

pub(crate) fn invalid(kind: &str, param: &str, reason: String) -> FlowError {
    FlowError::InvalidParam {
        kind: kind.to_string(),
        param: param.to_string(),
        reason,
    }
}

// =============================================================================
// PAYLOAD
// =============================================================================

/// Serializable description of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePayload {
    pub kind: String,
    #[serde(default)]
    pub guid: Option<NodeGuid>,
    #[serde(default)]
    pub params: NodeParams,
}

impl NodePayload {
    /// Payload without a fixed guid.
    #[must_use]
    pub fn new(kind: &str, params: NodeParams) -> Self {
        Self {
            kind: kind.to_string(),
            guid: None,
            params,
        }
    }

    /// Payload describing an existing node.
    #[must_use]
    pub fn from_node(guid: NodeGuid, node: &dyn Node) -> Self {
        Self {
            kind: node.kind().to_string(),
            guid: Some(guid),
            params: node.params(),
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Constructor for one node kind.
pub type NodeFactory = Box<dyn Fn(&NodeParams) -> Result<Box<dyn Node>, FlowError> + Send + Sync>;

/// Maps kind names to node constructors.
#[derive(Default)]
pub struct NodeRegistry {
    factories: BTreeMap<String, NodeFactory>,
}

impl NodeRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every builtin node kind.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(HeightNoise::KIND, |params| {
            Ok(Box::new(HeightNoise::from_params(params)?))
        });
        registry.register(BlendHeights::KIND, |params| {
            Ok(Box::new(BlendHeights::from_params(params)?))
        });
        registry.register(NormalFromHeight::KIND, |_| Ok(Box::new(NormalFromHeight)));
        registry.register(SlopeFromNormal::KIND, |_| Ok(Box::new(SlopeFromNormal)));
        registry.register(ScatterPoints::KIND, |params| {
            Ok(Box::new(ScatterPoints::from_params(params)?))
        });
        registry
    }

    /// Register or replace the constructor for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&NodeParams) -> Result<Box<dyn Node>, FlowError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    /// Build the node a payload describes.
    pub fn create(&self, payload: &NodePayload) -> Result<Box<dyn Node>, FlowError> {
        let factory = self
            .factories
            .get(&payload.kind)
            .ok_or_else(|| FlowError::UnknownNodeKind(payload.kind.clone()))?;
        factory(&payload.params)
    }

    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds in name order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> + '_ {
        self.factories.keys().map(String::as_str)
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
