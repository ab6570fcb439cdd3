//! Synthetic two-dimensional clean distributions.

use std::{f64::consts::PI, sync::Mutex};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::{corruption::lock, CleanSource, Result};

/// Alternating unit squares on `[-4, 4]²`.
pub struct Checkerboard {
    rng: Mutex<StdRng>,
}

impl Checkerboard {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl CleanSource for Checkerboard {
    fn name(&self) -> String {
        "checker".to_string()
    }

    fn feature_shape(&self) -> Vec<usize> {
        vec![2]
    }

    fn sample(&self, count: usize, device: &Device) -> Result<Tensor> {
        let mut rng = lock(&self.rng);
        let mut values = Vec::with_capacity(count * 2);
        for _ in 0..count {
            let x: f64 = rng.gen_range(-2.0..2.0);
            let band = if rng.gen_bool(0.5) { 0.0 } else { -2.0 };
            let parity = (x.floor() as i64).rem_euclid(2) as f64;
            let y = rng.gen::<f64>() + band + parity;
            values.push((2.0 * x) as f32);
            values.push((2.0 * y) as f32);
        }
        Ok(Tensor::from_vec(values, (count, 2), device)?)
    }
}

/// Two interleaved half circles with Gaussian jitter.
pub struct TwoMoons {
    noise: f64,
    rng: Mutex<StdRng>,
}

impl TwoMoons {
    pub fn new(noise: f64, seed: u64) -> Self {
        Self {
            noise,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl CleanSource for TwoMoons {
    fn name(&self) -> String {
        "moon".to_string()
    }

    fn feature_shape(&self) -> Vec<usize> {
        vec![2]
    }

    fn sample(&self, count: usize, device: &Device) -> Result<Tensor> {
        let mut rng = lock(&self.rng);
        let mut values = Vec::with_capacity(count * 2);
        for _ in 0..count {
            let angle = rng.gen_range(0.0..PI);
            let (x, y) = if rng.gen_bool(0.5) {
                (angle.cos(), angle.sin())
            } else {
                (1.0 - angle.cos(), 0.5 - angle.sin())
            };
            let jitter_x: f64 = rng.sample(StandardNormal);
            let jitter_y: f64 = rng.sample(StandardNormal);
            values.push((2.0 * (x - 0.5 + self.noise * jitter_x)) as f32);
            values.push((2.0 * (y - 0.25 + self.noise * jitter_y)) as f32);
        }
        Ok(Tensor::from_vec(values, (count, 2), device)?)
    }
}

/// Equal-weight mixture of axis-aligned Gaussians.
pub struct GaussianMixture {
    means: Vec<[f64; 2]>,
    std: [f64; 2],
    rng: Mutex<StdRng>,
}

impl GaussianMixture {
    pub fn new(means: Vec<[f64; 2]>, variance: [f64; 2], seed: u64) -> Self {
        Self {
            means,
            std: [variance[0].sqrt(), variance[1].sqrt()],
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Four components on the circle of radius 5 at angles `i·π/4`, variance 0.7.
    pub fn ring(seed: u64) -> Self {
        let means = (0..4)
            .map(|i| {
                let angle = i as f64 * PI / 4.0;
                [5.0 * angle.sin(), 5.0 * angle.cos()]
            })
            .collect();
        Self::new(means, [0.7, 0.7], seed)
    }
}

impl CleanSource for GaussianMixture {
    fn name(&self) -> String {
        "gmm".to_string()
    }

    fn feature_shape(&self) -> Vec<usize> {
        vec![2]
    }

    fn sample(&self, count: usize, device: &Device) -> Result<Tensor> {
        let mut rng = lock(&self.rng);
        let mut values = Vec::with_capacity(count * 2);
        for _ in 0..count {
            let mean = self.means[rng.gen_range(0..self.means.len())];
            for axis in 0..2 {
                let z: f64 = rng.sample(StandardNormal);
                values.push((mean[axis] + self.std[axis] * z) as f32);
            }
        }
        Ok(Tensor::from_vec(values, (count, 2), device)?)
    }
}
