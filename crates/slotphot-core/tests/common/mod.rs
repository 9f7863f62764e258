#![allow(dead_code)]

use std::io::Write;

use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Background level of the synthetic frames.
pub const SKY: f64 = 100.0;

/// Per-pixel Gaussian noise of the synthetic frames.
pub const NOISE: f64 = 5.0;

/// Peak amplitude of the synthetic star.
pub const STAR_PEAK: f64 = 2000.0;

pub const STAR_SIGMA: f64 = 2.0;

/// Standard normal deviate by the Box-Muller transform.
pub fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// One frame: a gentle sky gradient, a Gaussian star at `star` (row, col)
/// and white noise.
pub fn synthetic_frame(shape: (usize, usize), star: [f64; 2], rng: &mut StdRng) -> Array2<f64> {
    let (h, w) = shape;
    Array2::from_shape_fn((h, w), |(r, c)| {
        let sky = SKY + 0.02 * r as f64 - 0.01 * c as f64;
        let d2 = (r as f64 - star[0]).powi(2) + (c as f64 - star[1]).powi(2);
        let star = STAR_PEAK * (-d2 / (2.0 * STAR_SIGMA * STAR_SIGMA)).exp();
        sky + star + NOISE * gaussian(rng)
    })
}

/// A static-camera cube of `n` frames with one bright star.
pub fn synthetic_cube(n: usize, shape: (usize, usize), star: [f64; 2], seed: u64) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut cube = Array3::<f64>::zeros((n, shape.0, shape.1));
    for mut frame in cube.outer_iter_mut() {
        frame.assign(&synthetic_frame(shape, star, &mut rng));
    }
    cube
}

/// Serialise `values` (C order) as a version 1.0 little-endian `.npy` file.
pub fn npy_bytes(shape: &[usize], values: &[f64]) -> Vec<u8> {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    let mut dict = format!(
        "{{'descr': '<f8', 'fortran_order': False, 'shape': ({}), }}",
        dims.join(", ")
    );
    // Magic, version and length take 10 bytes; pad the total to 64.
    let total = 10 + dict.len() + 1;
    dict.push_str(&" ".repeat((64 - total % 64) % 64));
    dict.push('\n');

    let mut buf = Vec::new();
    buf.extend_from_slice(b"\x93NUMPY");
    buf.extend_from_slice(&[1, 0]);
    buf.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    buf.extend_from_slice(dict.as_bytes());
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Write an array to a temporary `.npy` file kept alive by the handle.
pub fn write_test_npy(shape: &[usize], values: &[f64]) -> tempfile::NamedTempFile {
    let mut f = tempfile::Builder::new()
        .suffix(".npy")
        .tempfile()
        .expect("create temp file");
    f.write_all(&npy_bytes(shape, values)).expect("write npy data");
    f.flush().expect("flush");
    f
}
