//! Height producers.

use super::registry::invalid;
use super::{fractal, HeightMap, NodeParams};
use crate::node::{Inputs, Node, NodeTask, Outputs, ProcessContext};
use crate::primitives::ROWS_PER_JOB;
use crate::{FlowError, JobHandle, MeshSettings, PortKind, PortSpec};
use std::sync::Arc;

const HEIGHT_OUT: &[PortSpec] = &[PortSpec::required("height", PortKind::Height)];

// =============================================================================
// HEIGHT NOISE
// =============================================================================

/// Fractal value noise scaled to `amplitude`.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightNoise {
    pub amplitude: f32,
    /// Lattice cells per world unit of the first octave.
    pub frequency: f32,
    pub octaves: u32,
    /// Mixed with the branch seed.
    pub seed: u64,
}

impl HeightNoise {
    pub const KIND: &'static str = "height_noise";

    #[must_use]
    pub fn new(amplitude: f32, frequency: f32) -> Self {
        Self {
            amplitude,
            frequency,
            octaves: 4,
            seed: 0,
        }
    }

    pub fn from_params(params: &NodeParams) -> Result<Self, FlowError> {
        let defaults = Self::new(1.0, 0.05);
        let node = Self {
            amplitude: params.f32_or(Self::KIND, "amplitude", defaults.amplitude)?,
            frequency: params.f32_or(Self::KIND, "frequency", defaults.frequency)?,
            octaves: params.u64_or(Self::KIND, "octaves", u64::from(defaults.octaves))? as u32,
            seed: params.u64_or(Self::KIND, "seed", defaults.seed)?,
        };
        if node.frequency <= 0.0 {
            return Err(invalid(Self::KIND, "frequency", "must be positive".to_string()));
        }
        if node.octaves == 0 || node.octaves > 16 {
            return Err(invalid(Self::KIND, "octaves", "must be within 1..=16".to_string()));
        }
        Ok(node)
    }

    /// Height at a world position.
    #[must_use]
    pub fn sample(&self, x: f32, z: f32, seed: u64) -> f32 {
        self.amplitude * fractal(x, z, seed ^ self.seed, self.octaves, self.frequency)
    }
}

impl Node for HeightNoise {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn inputs(&self) -> &[PortSpec] {
        &[]
    }

    fn outputs(&self) -> &[PortSpec] {
        HEIGHT_OUT
    }

    fn create_task(&self, _settings: &MeshSettings) -> Box<dyn NodeTask> {
        Box::new(HeightNoiseTask {
            node: self.clone(),
            map: None,
            handle: JobHandle::completed(),
        })
    }

    fn params(&self) -> NodeParams {
        NodeParams::new()
            .with("amplitude", f64::from(self.amplitude))
            .with("frequency", f64::from(self.frequency))
            .with("octaves", f64::from(self.octaves))
            .with("seed", self.seed as f64)
    }
}

struct HeightNoiseTask {
    node: HeightNoise,
    map: Option<HeightMap>,
    handle: JobHandle,
}

impl NodeTask for HeightNoiseTask {
    fn set_input_values(&mut self, _inputs: &mut Inputs<'_>) -> bool {
        true
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<bool, FlowError> {
        if self.map.is_none() {
            let settings = ctx.settings().clone();
            let stride = settings.padded_size();
            let values = ctx.acquire::<f32>(stride * stride);

            let target = values.clone();
            let node = self.node.clone();
            let stripes = stride.div_ceil(ROWS_PER_JOB);
            self.handle = ctx.schedule_batch(&JobHandle::completed(), stripes, move |stripe| {
                let start = stripe * ROWS_PER_JOB;
                let end = (start + ROWS_PER_JOB).min(stride);
                let pad = settings.padding as f32;
                let mut rows = Vec::with_capacity((end - start) * stride);
                for y in start..end {
                    let wz = settings.origin[1] + (y as f32 - pad) * settings.cell_size;
                    for x in 0..stride {
                        let wx = settings.origin[0] + (x as f32 - pad) * settings.cell_size;
                        rows.push(node.sample(wx, wz, settings.seed));
                    }
                }
                match target.write() {
                    Ok(mut data) => {
                        if let Some(dst) = data.get_mut(start * stride..end * stride) {
                            dst.copy_from_slice(&rows);
                        }
                    }
                    Err(err) => tracing::error!(error = %err, "height rows dropped"),
                }
            });

            self.map = Some(HeightMap {
                resolution: ctx.settings().resolution,
                padding: ctx.settings().padding,
                values,
            });
        }
        Ok(self.handle.is_completed())
    }

    fn cache_output_values(&mut self, outputs: &mut Outputs<'_>) {
        if let Some(map) = self.map.take() {
            outputs.publish("height", map, self.handle.clone());
        }
    }
}

// =============================================================================
// BLEND HEIGHTS
// =============================================================================

const BLEND_IN: &[PortSpec] = &[
    PortSpec::required("a", PortKind::Height),
    PortSpec::required("b", PortKind::Height),
];

/// `a + (b - a) * weight`, cell by cell.
#[derive(Debug, Clone, PartialEq)]
pub struct BlendHeights {
    pub weight: f32,
}

impl BlendHeights {
    pub const KIND: &'static str = "blend_heights";

    #[must_use]
    pub fn new(weight: f32) -> Self {
        Self { weight }
    }

    pub fn from_params(params: &NodeParams) -> Result<Self, FlowError> {
        let weight = params.f32_or(Self::KIND, "weight", 0.5)?;
        if !(0.0..=1.0).contains(&weight) {
            return Err(invalid(Self::KIND, "weight", format!("{weight} outside 0..=1")));
        }
        Ok(Self { weight })
    }
}

impl Node for BlendHeights {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn inputs(&self) -> &[PortSpec] {
        BLEND_IN
    }

    fn outputs(&self) -> &[PortSpec] {
        HEIGHT_OUT
    }

    fn create_task(&self, _settings: &MeshSettings) -> Box<dyn NodeTask> {
        Box::new(BlendTask {
            weight: self.weight,
            a: None,
            b: None,
            dependencies: JobHandle::completed(),
            map: None,
            handle: JobHandle::completed(),
        })
    }

    fn params(&self) -> NodeParams {
        NodeParams::new().with("weight", f64::from(self.weight))
    }
}

struct BlendTask {
    weight: f32,
    a: Option<Arc<HeightMap>>,
    b: Option<Arc<HeightMap>>,
    dependencies: JobHandle,
    map: Option<HeightMap>,
    handle: JobHandle,
}

impl NodeTask for BlendTask {
    fn set_input_values(&mut self, inputs: &mut Inputs<'_>) -> bool {
        self.a = inputs.try_get_input::<HeightMap>("a");
        self.b = inputs.try_get_input::<HeightMap>("b");
        self.dependencies = inputs.dependencies();
        self.a.is_some() && self.b.is_some()
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<bool, FlowError> {
        if self.map.is_none() {
            let (Some(a), Some(b)) = (self.a.clone(), self.b.clone()) else {
                return Ok(false);
            };
            if a.values.len() != b.values.len() {
                return Err(FlowError::ShapeMismatch {
                    expected: a.values.len(),
                    actual: b.values.len(),
                });
            }

            let values = ctx.acquire::<f32>(a.values.len());
            let target = values.clone();
            let weight = self.weight;
            self.handle = ctx.schedule(&self.dependencies, move || {
                let blend = || -> Result<(), FlowError> {
                    let lhs = a.values.read()?;
                    let rhs = b.values.read()?;
                    let mut out = target.write()?;
                    for ((dst, l), r) in out.iter_mut().zip(lhs.iter()).zip(rhs.iter()) {
                        *dst = l + (r - l) * weight;
                    }
                    Ok(())
                };
                if let Err(err) = blend() {
                    tracing::error!(error = %err, "blend skipped");
                }
            });

            self.map = Some(HeightMap {
                resolution: ctx.settings().resolution,
                padding: ctx.settings().padding,
                values,
            });
        }
        Ok(self.handle.is_completed())
    }

    fn cache_output_values(&mut self, outputs: &mut Outputs<'_>) {
        if let Some(map) = self.map.take() {
            outputs.publish("height", map, self.handle.clone());
        }
    }
}
