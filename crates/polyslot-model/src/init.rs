//! Weight initialization
//!
//! Matrices are drawn from a normal distribution with
//! `std = 1 / sqrt(fan_in) * min(1, sqrt(fan_out / fan_in))`, sampled with a
//! Box-Muller transform over a seeded `StdRng` so that a unit created twice
//! from the same configuration is bit-identical.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Initialize a `[rows, cols]` weight matrix
///
/// # Arguments
/// * `rows` - Number of rows (fan_in)
/// * `cols` - Number of columns (fan_out)
/// * `seed` - Random seed for reproducibility
///
/// # Returns
/// Weight matrix with shape `[rows, cols]`
pub(crate) fn init_weight(rows: usize, cols: usize, seed: u64) -> Array2<f32> {
    let fan_in = rows.max(1) as f32;
    let fan_out = cols.max(1) as f32;
    let std = (1.0 / fan_in.sqrt()) * 1.0_f32.min((fan_out / fan_in).sqrt());

    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_simple_fn((rows, cols), || {
        let u1: f32 = rng.gen_range(0.0001_f32..1.0_f32);
        let u2: f32 = rng.gen_range(0.0_f32..1.0_f32);
        let z = (-2.0_f32 * u1.ln()).sqrt() * (2.0_f32 * std::f32::consts::PI * u2).cos();
        std * z
    })
}

/// Derive a per-parameter seed from a unit seed
pub(crate) fn param_seed(seed: u64, index: u64) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(index)
}
