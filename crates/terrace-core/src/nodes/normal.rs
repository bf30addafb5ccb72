//! Surface derivatives of a height field.

use super::{HeightMap, NormalMap, ScalarMap};
use crate::node::{Amplifier, Inputs, Node, NodeTask, Outputs, ProcessContext};
use crate::primitives::ROWS_PER_JOB;
use crate::{FlowError, JobHandle, MeshSettings, PortKind, PortRef, PortSpec};
use std::sync::Arc;

// =============================================================================
// NORMAL FROM HEIGHT
// =============================================================================

const NORMAL_IN: &[PortSpec] = &[PortSpec::required("height", PortKind::Height)];
const NORMAL_OUT: &[PortSpec] = &[PortSpec::required("normal", PortKind::Normal)];

/// Central-difference normals. Reads one border cell around the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalFromHeight;

impl NormalFromHeight {
    pub const KIND: &'static str = "normal_from_height";
}

impl Node for NormalFromHeight {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn inputs(&self) -> &[PortSpec] {
        NORMAL_IN
    }

    fn outputs(&self) -> &[PortSpec] {
        NORMAL_OUT
    }

    fn padding(&self) -> u32 {
        1
    }

    fn create_task(&self, _settings: &MeshSettings) -> Box<dyn NodeTask> {
        Box::new(NormalTask {
            height: None,
            dependencies: JobHandle::completed(),
            map: None,
            handle: JobHandle::completed(),
        })
    }
}

struct NormalTask {
    height: Option<Arc<HeightMap>>,
    dependencies: JobHandle,
    map: Option<NormalMap>,
    handle: JobHandle,
}

impl NodeTask for NormalTask {
    fn set_input_values(&mut self, inputs: &mut Inputs<'_>) -> bool {
        self.height = inputs.try_get_input::<HeightMap>("height");
        self.dependencies = inputs.dependencies();
        self.height.is_some()
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<bool, FlowError> {
        if self.map.is_none() {
            let Some(height) = self.height.clone() else {
                return Ok(false);
            };
            let size = height.resolution as usize;
            let values = ctx.acquire::<[f32; 3]>(size * size);
            let target = values.clone();
            let cell = ctx.settings().cell_size;

            let stripes = size.div_ceil(ROWS_PER_JOB);
            self.handle = ctx.schedule_batch(&self.dependencies, stripes, move |stripe| {
                if let Err(err) = fill_normals(&height, cell, &target, stripe) {
                    tracing::error!(error = %err, "normal rows dropped");
                }
            });
            self.map = Some(NormalMap {
                resolution: size as u32,
                values,
            });
        }
        Ok(self.handle.is_completed())
    }

    fn cache_output_values(&mut self, outputs: &mut Outputs<'_>) {
        if let Some(map) = self.map.take() {
            outputs.publish("normal", map, self.handle.clone());
        }
    }
}

fn fill_normals(
    height: &HeightMap,
    cell: f32,
    target: &crate::pool::PooledBuffer<[f32; 3]>,
    stripe: usize,
) -> Result<(), FlowError> {
    let size = height.resolution as usize;
    let stride = height.stride();
    let pad = height.padding as usize;
    let start = stripe * ROWS_PER_JOB;
    let end = (start + ROWS_PER_JOB).min(size);

    let heights = height.values.read()?;
    let at = |x: usize, y: usize| -> f32 {
        let x = x.min(stride - 1);
        let y = y.min(stride - 1);
        heights.get(y * stride + x).copied().unwrap_or(0.0)
    };

    let mut rows = Vec::with_capacity((end - start) * size);
    for y in start..end {
        for x in 0..size {
            let (px, py) = (x + pad, y + pad);
            let left = at(px.saturating_sub(1), py);
            let right = at(px + 1, py);
            let down = at(px, py.saturating_sub(1));
            let up = at(px, py + 1);
            let n = [(left - right) / (2.0 * cell), 1.0, (down - up) / (2.0 * cell)];
            let len = (n[0] * n[0] + n[1] * n[1] + n[2] * n[2]).sqrt();
            rows.push([n[0] / len, n[1] / len, n[2] / len]);
        }
    }

    let mut out = target.write()?;
    if let Some(dst) = out.get_mut(start * size..end * size) {
        dst.copy_from_slice(&rows);
    }
    Ok(())
}

// =============================================================================
// SLOPE FROM NORMAL
// =============================================================================

const SLOPE_IN: &[PortSpec] = &[PortSpec::required("normal", PortKind::Normal)];
const SLOPE_OUT: &[PortSpec] = &[PortSpec::required("slope", PortKind::Scalar)];

/// Angle between the surface and the horizontal, in degrees.
///
/// May be wired straight to a height output: amplification then inserts a
/// hidden `NormalFromHeight` in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlopeFromNormal;

impl SlopeFromNormal {
    pub const KIND: &'static str = "slope_from_normal";
}

impl Node for SlopeFromNormal {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn inputs(&self) -> &[PortSpec] {
        SLOPE_IN
    }

    fn outputs(&self) -> &[PortSpec] {
        SLOPE_OUT
    }

    fn adapts_input(&self, port: &str, source: PortKind) -> bool {
        port == "normal" && source == PortKind::Height
    }

    fn amplify_graph(&self, amplifier: &mut Amplifier<'_>) -> bool {
        let Some((source, PortKind::Height)) = amplifier.source_of("normal") else {
            return false;
        };
        let normal = amplifier.insert_node(Box::new(NormalFromHeight));
        amplifier.connect(source, PortRef::new(normal, "height"));
        amplifier.connect(
            PortRef::new(normal, "normal"),
            PortRef::new(amplifier.node(), "normal"),
        );
        true
    }

    fn create_task(&self, _settings: &MeshSettings) -> Box<dyn NodeTask> {
        Box::new(SlopeTask {
            normal: None,
            dependencies: JobHandle::completed(),
            map: None,
            handle: JobHandle::completed(),
        })
    }
}

struct SlopeTask {
    normal: Option<Arc<NormalMap>>,
    dependencies: JobHandle,
    map: Option<ScalarMap>,
    handle: JobHandle,
}

impl NodeTask for SlopeTask {
    fn set_input_values(&mut self, inputs: &mut Inputs<'_>) -> bool {
        self.normal = inputs.try_get_input::<NormalMap>("normal");
        self.dependencies = inputs.dependencies();
        self.normal.is_some()
    }

    fn process(&mut self, ctx: &mut ProcessContext<'_>) -> Result<bool, FlowError> {
        if self.map.is_none() {
            let Some(normal) = self.normal.clone() else {
                return Ok(false);
            };
            let values = ctx.acquire::<f32>(normal.values.len());
            let target = values.clone();
            let resolution = normal.resolution;

            self.handle = ctx.schedule(&self.dependencies, move || {
                let slope = || -> Result<(), FlowError> {
                    let normals = normal.values.read()?;
                    let mut out = target.write()?;
                    for (dst, n) in out.iter_mut().zip(normals.iter()) {
                        *dst = n[1].clamp(-1.0, 1.0).acos().to_degrees();
                    }
                    Ok(())
                };
                if let Err(err) = slope() {
                    tracing::error!(error = %err, "slope skipped");
                }
            });
            self.map = Some(ScalarMap { resolution, values });
        }
        Ok(self.handle.is_completed())
    }

    fn cache_output_values(&mut self, outputs: &mut Outputs<'_>) {
        if let Some(map) = self.map.take() {
            outputs.publish("slope", map, self.handle.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPool, PooledBuffer};

    fn flat_ramp(resolution: u32, padding: u32, rise: f32) -> (BufferPool, HeightMap) {
        let mut pool = BufferPool::new();
        let mut pack = pool.new_pack();
        let stride = (resolution + 2 * padding) as usize;
        let values: Vec<f32> = (0..stride * stride)
            .map(|i| (i % stride) as f32 * rise)
            .collect();
        let values = pool.acquire_from(&mut pack, &values);
        (
            pool,
            HeightMap {
                resolution,
                padding,
                values,
            },
        )
    }

    fn normals_of(map: &HeightMap) -> Vec<[f32; 3]> {
        let size = map.resolution as usize;
        let mut pool = BufferPool::new();
        let mut pack = pool.new_pack();
        let target: PooledBuffer<[f32; 3]> = pool.acquire(&mut pack, size * size);
        for stripe in 0..size.div_ceil(ROWS_PER_JOB) {
            fill_normals(map, 1.0, &target, stripe).expect("fill");
        }
        target.to_vec().expect("read")
    }

    #[test]
    fn flat_ground_points_up() {
        let (_pool, map) = flat_ramp(4, 1, 0.0);
        for n in normals_of(&map) {
            assert_eq!(n, [0.0, 1.0, 0.0]);
        }
    }

    #[test]
    fn ramp_tilts_against_the_rise() {
        let (_pool, map) = flat_ramp(4, 1, 1.0);
        for n in normals_of(&map) {
            assert!(n[0] < 0.0);
            assert!((n[0] - n[1] * -1.0).abs() < 1e-5);
            assert!(n[2].abs() < 1e-6);
        }
    }
}
