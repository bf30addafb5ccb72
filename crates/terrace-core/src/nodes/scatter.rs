//! Point scattering over a height field.
//!
//! Work is spread over several ticks: each `process` call schedules one
//! batch of rows and returns `false`, and the task's row cursor records
//! where the next call picks up.

use super::registry::invalid;
use super::{hash2, unit, HeightMap, NodeParams, PointSet, ScalarMap};
use crate::node::{Inputs, Node, NodeTask, Outputs, ProcessContext};
use crate::{FlowError, JobHandle, MeshSettings, PortKind, PortSpec};
use std::sync::{Arc, Mutex};

const SCATTER_IN: &[PortSpec] = &[
    PortSpec::required("height", PortKind::Height),
    PortSpec::optional("slope", PortKind::Scalar),
];
const SCATTER_OUT: &[PortSpec] = &[PortSpec::required("points", PortKind::Points)];

/// Places at most one jittered point per cell.
#[derive(Debug, Clone, PartialEq)]
pub struct ScatterPoints {
    /// Chance of a point per cell, `0..=1`.
    pub density: f32,
    pub min_height: f32,
    /// Cells steeper than this (degrees) stay empty. Needs `slope` connected.
    pub max_slope: f32,
    pub rows_per_tick: u32,
    pub seed: u64,
}

impl Default for ScatterPoints {
    fn default() -> Self {
        Self {
            density: 0.25,
            min_height: f32::MIN,
            max_slope: 90.0,
            rows_per_tick: 8,
            seed: 0,
        }
    }
}

impl ScatterPoints {
    pub const KIND: &'static str = "scatter_points";

    pub fn from_params(params: &NodeParams) -> Result<Self, FlowError> {
        let defaults = Self::default();
        let node = Self {
            density: params.f32_or(Self::KIND, "density", defaults.density)?,
            min_height: params.f32_or(Self::KIND, "min_height", defaults.min_height)?,
            max_slope: params.f32_or(Self::KIND, "max_slope", defaults.max_slope)?,
            rows_per_tick: params.u64_or(Self::KIND, "rows_per_tick", u64::from(defaults.rows_per_tick))?
                as u32,
            seed: params.u64_or(Self::KIND, "seed", defaults.seed)?,
        };
        if !(0.0..=1.0).contains(&node.density) {
            return Err(invalid(Self::KIND, "density", format!("{} outside 0..=1", node.density)));
        }
        if node.rows_per_tick == 0 {
            return Err(invalid(Self::KIND, "rows_per_tick", "must be positive".to_string()));
        }
        Ok(node)
    }
}

impl Node for ScatterPoints {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn inputs(&self) -> &[PortSpec] {
        SCATTER_IN
    }

    fn outputs(&self) -> &[PortSpec] {
        SCATTER_OUT
    }

    fn create_task(&self, settings: &MeshSettings) -> Box<dyn NodeTask> {
        Box::new(ScatterTask {
            node: self.clone(),
            settings: settings.clone(),
            height: None,
            slope: None,
            dependencies: JobHandle::completed(),
            next_row: 0,
            batch: JobHandle::completed(),
            points: Arc::new(Mutex::new(Vec::new())),
        })
    }

    fn params(&self) -> NodeParams {
        NodeParams::new()
            .with("density", f64::from(self.density))
            .with("min_height", f64::from(self.min_height))
            .with("max_slope", f64::from(self.max_slope))
            .with("rows_per_tick", f64::from(self.rows_per_tick))
            .with("seed", self.seed as f64)
    }
}

struct ScatterTask {
    node: ScatterPoints,
    settings: MeshSettings,
    height: Option<Arc<HeightMap>>,
    slope: Option<Arc<ScalarMap>>,
    dependencies: JobHandle,
    /// First row not yet scheduled.
    next_row: u32,
    batch: JobHandle,
    points: Arc<Mutex<Vec<[f32; 3]>>>,
}

impl NodeTask for ScatterTask {
    fn set_input_values(&mut self, inputs: &mut Inputs<'_>) -> bool {
        self.height = inputs.try_get_input::<HeightMap>("height");
        if inputs.is_connected("slope") {
            self.slope = inputs.try_get_input::<ScalarMap>("slope");
            if self.slope.is_none() {
                return false;
            }
        }
        self.dependencies = inputs.dependencies();
        self.height.is_some()
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<bool, FlowError> {
        if !self.batch.is_completed() {
            return Ok(false);
        }
        let Some(height) = self.height.clone() else {
            return Ok(false);
        };
        if self.next_row >= height.resolution {
            return Ok(true);
        }

        let rows = self.next_row..(self.next_row + self.node.rows_per_tick).min(height.resolution);
        self.next_row = rows.end;
        let batch = Batch {
            node: self.node.clone(),
            settings: self.settings.clone(),
            height,
            slope: self.slope.clone(),
            rows,
            points: Arc::clone(&self.points),
        };
        self.batch = ctx.schedule(&self.dependencies, move || {
            if let Err(err) = batch.run() {
                tracing::error!(error = %err, "scatter batch dropped");
            }
        });
        tracing::trace!(node = %ctx.node(), next_row = self.next_row, "scatter batch scheduled");
        Ok(false)
    }

    fn cache_output_values(&mut self, outputs: &mut Outputs<'_>) {
        let points = match self.points.lock() {
            Ok(mut points) => std::mem::take(&mut *points),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        outputs.publish("points", PointSet { points }, self.batch.clone());
    }
}

struct Batch {
    node: ScatterPoints,
    settings: MeshSettings,
    height: Arc<HeightMap>,
    slope: Option<Arc<ScalarMap>>,
    rows: std::ops::Range<u32>,
    points: Arc<Mutex<Vec<[f32; 3]>>>,
}

impl Batch {
    fn run(&self) -> Result<(), FlowError> {
        let heights = self.height.values.read()?;
        let slopes = match &self.slope {
            Some(slope) => Some(slope.values.read()?),
            None => None,
        };
        let size = self.height.resolution as usize;
        let stride = self.height.stride();
        let pad = self.height.padding as usize;
        let seed = self.settings.seed ^ self.node.seed;

        let mut placed = Vec::new();
        for y in self.rows.clone() {
            let y = y as usize;
            for x in 0..size {
                let hash = hash2(x as i64, y as i64, seed);
                if unit(hash) >= self.node.density {
                    continue;
                }
                let h = heights.get((y + pad) * stride + x + pad).copied().unwrap_or(0.0);
                if h < self.node.min_height {
                    continue;
                }
                if let Some(slopes) = &slopes {
                    if slopes.get(y * size + x).is_some_and(|s| *s > self.node.max_slope) {
                        continue;
                    }
                }
                let jx = unit(hash.rotate_left(21));
                let jz = unit(hash.rotate_left(42));
                placed.push([
                    self.settings.origin[0] + (x as f32 + jx) * self.settings.cell_size,
                    h,
                    self.settings.origin[1] + (y as f32 + jz) * self.settings.cell_size,
                ]);
            }
        }

        match self.points.lock() {
            Ok(mut points) => points.extend(placed),
            Err(poisoned) => poisoned.into_inner().extend(placed),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_params_rejects_out_of_range_density() {
        let params = NodeParams::new().with("density", 2.0);
        assert!(matches!(
            ScatterPoints::from_params(&params),
            Err(FlowError::InvalidParam { .. })
        ));
    }

    #[test]
    fn params_round_trip() {
        let node = ScatterPoints {
            density: 0.5,
            rows_per_tick: 3,
            ..ScatterPoints::default()
        };
        let rebuilt = ScatterPoints::from_params(&node.params()).expect("params");
        assert_eq!(rebuilt, node);
    }
}
