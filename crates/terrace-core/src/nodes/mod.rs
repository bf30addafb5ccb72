//! # Builtin Nodes
//!
//! Terrain nodes shipped with the core, plus the data types they exchange:
//! - `HeightNoise`: fractal value noise into a padded `HeightMap`
//! - `BlendHeights`: weighted mix of two height maps
//! - `NormalFromHeight`: surface normals, inserted by amplification
//! - `SlopeFromNormal`: slope angle in degrees per cell
//! - `ScatterPoints`: multi-tick point placement
//!
//! Every grid is row-major. Height maps carry `padding` extra cells on each
//! side so neighbour lookups at the border stay inside the buffer.

mod height;
mod normal;
mod registry;
mod scatter;

pub use height::{BlendHeights, HeightNoise};
pub use normal::{NormalFromHeight, SlopeFromNormal};
pub use registry::{NodeFactory, NodeParams, NodePayload, NodeRegistry};
pub use scatter::ScatterPoints;

use crate::pool::PooledBuffer;
use crate::FlowError;

// =============================================================================
// DATA TYPES
// =============================================================================

/// Height field with a border of `padding` cells.
#[derive(Debug, Clone)]
pub struct HeightMap {
    pub resolution: u32,
    pub padding: u32,
    pub values: PooledBuffer<f32>,
}

impl HeightMap {
    /// Cells per padded row.
    #[must_use]
    pub fn stride(&self) -> usize {
        self.resolution as usize + 2 * self.padding as usize
    }

    /// Copy of the grid without its border.
    pub fn interior(&self) -> Result<Vec<f32>, FlowError> {
        let values = self.values.read()?;
        let stride = self.stride();
        let pad = self.padding as usize;
        let size = self.resolution as usize;
        let mut out = Vec::with_capacity(size * size);
        for row in values.chunks(stride).skip(pad).take(size) {
            out.extend(row.iter().skip(pad).take(size));
        }
        Ok(out)
    }
}

/// Unit surface normal per cell, `[x, y, z]` with y up.
#[derive(Debug, Clone)]
pub struct NormalMap {
    pub resolution: u32,
    pub values: PooledBuffer<[f32; 3]>,
}

/// One scalar per cell.
#[derive(Debug, Clone)]
pub struct ScalarMap {
    pub resolution: u32,
    pub values: PooledBuffer<f32>,
}

/// World-space points, `[x, height, z]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointSet {
    pub points: Vec<[f32; 3]>,
}

// =============================================================================
// NOISE
// =============================================================================

/// 64-bit lattice hash.
pub(crate) fn hash2(x: i64, y: i64, seed: u64) -> u64 {
    let mut h = seed
        ^ (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (y as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F);
    h ^= h >> 33;
    h = h.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    h ^= h >> 33;
    h = h.wrapping_mul(0xC4CE_B9FE_1A85_EC53);
    h ^ (h >> 33)
}

/// Top 24 bits of a hash as a float in `[0, 1)`.
pub(crate) fn unit(hash: u64) -> f32 {
    (hash >> 40) as f32 / (1_u64 << 24) as f32
}

fn value_noise(x: f32, y: f32, seed: u64) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let (ix, iy) = (x0 as i64, y0 as i64);
    let fade = |t: f32| t * t * (3.0 - 2.0 * t);
    let tx = fade(x - x0);
    let ty = fade(y - y0);

    let c00 = unit(hash2(ix, iy, seed));
    let c10 = unit(hash2(ix + 1, iy, seed));
    let c01 = unit(hash2(ix, iy + 1, seed));
    let c11 = unit(hash2(ix + 1, iy + 1, seed));

    let top = c00 + (c10 - c00) * tx;
    let bottom = c01 + (c11 - c01) * tx;
    top + (bottom - top) * ty
}

/// Fractal value noise in `[0, 1)`.
pub(crate) fn fractal(x: f32, y: f32, seed: u64, octaves: u32, frequency: f32) -> f32 {
    let mut sum = 0.0;
    let mut norm = 0.0;
    let mut amplitude = 1.0;
    let mut freq = frequency;
    for octave in 0..octaves.max(1) {
        sum += amplitude * value_noise(x * freq, y * freq, seed.wrapping_add(u64::from(octave)));
        norm += amplitude;
        amplitude *= 0.5;
        freq *= 2.0;
    }
    sum / norm
}
