//! Forward corruption operators.
//!
//! Every operator owns a seeded RNG, so a run is reproducible from its seed while
//! each call still draws fresh corruption.

use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{DType, Tensor};
use interpolant::{standard_normal_like, Corruption, ForwardOperator};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::{DataError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    GaussianNoise,
    RandomMask,
    Projection,
}

impl CorruptionKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gaussian_noise" | "noise" => Ok(Self::GaussianNoise),
            "random_mask" | "mask" | "inpainting" => Ok(Self::RandomMask),
            "projection" | "random_projection" => Ok(Self::Projection),
            other => Err(DataError::UnknownCorruption(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::GaussianNoise => "gaussian_noise",
            Self::RandomMask => "random_mask",
            Self::Projection => "projection",
        }
    }

    /// Whether the operator exposes side information worth conditioning on.
    pub fn uses_latents(self) -> bool {
        !matches!(self, Self::GaussianNoise)
    }

    /// Flattened latent width for an input with `input_dim` features.
    pub fn latent_dim(self, levels: &[f64], input_dim: usize) -> Option<usize> {
        match self {
            Self::GaussianNoise => None,
            Self::RandomMask => Some(input_dim),
            Self::Projection => levels.first().map(|rank| *rank as usize * input_dim),
        }
    }

    pub fn build(self, levels: &[f64], seed: u64) -> Result<Arc<dyn ForwardOperator>> {
        let invalid = |reason: &str| DataError::InvalidLevels {
            name: self.as_str().to_string(),
            reason: reason.to_string(),
        };
        let level = |idx: usize| levels.get(idx).copied();

        match self {
            Self::GaussianNoise => {
                let sigma = level(0).ok_or_else(|| invalid("expected [sigma]"))?;
                if !(sigma.is_finite() && sigma >= 0.0) {
                    return Err(invalid("sigma must be finite and non-negative"));
                }
                Ok(Arc::new(GaussianNoise::new(sigma, seed)))
            }
            Self::RandomMask => {
                let drop =
                    level(0).ok_or_else(|| invalid("expected [drop_probability, sigma?]"))?;
                if !(0.0..1.0).contains(&drop) {
                    return Err(invalid("drop_probability must be in [0, 1)"));
                }
                let sigma = level(1).unwrap_or(0.0);
                if !(sigma.is_finite() && sigma >= 0.0) {
                    return Err(invalid("sigma must be finite and non-negative"));
                }
                Ok(Arc::new(RandomMask::new(drop, sigma, seed)))
            }
            Self::Projection => {
                let rank = level(0).ok_or_else(|| invalid("expected [rank, sigma?]"))?;
                if rank < 1.0 || rank.fract() != 0.0 {
                    return Err(invalid("rank must be a positive integer"));
                }
                let sigma = level(1).unwrap_or(0.0);
                if !(sigma.is_finite() && sigma >= 0.0) {
                    return Err(invalid("sigma must be finite and non-negative"));
                }
                Ok(Arc::new(RandomProjection::new(rank as usize, sigma, seed)))
            }
        }
    }
}

/// Resolves a corruption identifier and its levels into an operator.
pub fn build_operator(name: &str, levels: &[f64], seed: u64) -> Result<Arc<dyn ForwardOperator>> {
    CorruptionKind::parse(name)?.build(levels, seed)
}

/// Additive isotropic Gaussian noise, `y = x + sigma * z`.
pub struct GaussianNoise {
    sigma: f64,
    rng: Mutex<StdRng>,
}

impl GaussianNoise {
    pub fn new(sigma: f64, seed: u64) -> Self {
        Self {
            sigma,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl ForwardOperator for GaussianNoise {
    fn name(&self) -> &str {
        "gaussian_noise"
    }

    fn apply(&self, clean: &Tensor) -> interpolant::Result<Corruption> {
        let noise = standard_normal_like(&mut lock(&self.rng), clean)?;
        let corrupted = (clean + (noise * self.sigma)?)?;
        Ok(Corruption::new(corrupted, None))
    }
}

/// Drops each coordinate independently with `drop_probability` and adds optional
/// noise; the keep-mask is returned as the latent.
pub struct RandomMask {
    drop_probability: f64,
    sigma: f64,
    rng: Mutex<StdRng>,
}

impl RandomMask {
    pub fn new(drop_probability: f64, sigma: f64, seed: u64) -> Self {
        Self {
            drop_probability,
            sigma,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl ForwardOperator for RandomMask {
    fn name(&self) -> &str {
        "random_mask"
    }

    fn apply(&self, clean: &Tensor) -> interpolant::Result<Corruption> {
        let mut rng = lock(&self.rng);
        let keep = 1.0 - self.drop_probability;
        let flags: Vec<f32> = (0..clean.elem_count())
            .map(|_| if rng.gen_bool(keep) { 1.0 } else { 0.0 })
            .collect();
        let mask =
            Tensor::from_vec(flags, clean.dims(), clean.device())?.to_dtype(clean.dtype())?;

        let mut corrupted = clean.mul(&mask)?;
        if self.sigma > 0.0 {
            let noise = standard_normal_like(&mut rng, clean)?;
            corrupted = (corrupted + (noise * self.sigma)?)?;
        }
        Ok(Corruption::new(corrupted, Some(mask)))
    }
}

/// Orthogonal projection onto a random `rank`-dimensional subspace drawn per
/// example, expressed in data space: `y = Q Qᵀ x + sigma * z`. The orthonormal
/// basis `Q` of shape `(batch, dim, rank)` is the latent.
pub struct RandomProjection {
    rank: usize,
    sigma: f64,
    rng: Mutex<StdRng>,
}

impl RandomProjection {
    pub fn new(rank: usize, sigma: f64, seed: u64) -> Self {
        Self {
            rank,
            sigma,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn orthonormal_basis(&self, rng: &mut StdRng, batch: usize, dim: usize) -> Vec<f32> {
        let rank = self.rank;
        let mut data = vec![0f32; batch * dim * rank];
        let mut columns = vec![vec![0f64; dim]; rank];
        for b in 0..batch {
            for j in 0..rank {
                let mut column: Vec<f64> = (0..dim)
                    .map(|_| rng.sample::<f64, _>(StandardNormal))
                    .collect();
                for previous in &columns[..j] {
                    let dot: f64 = column.iter().zip(previous).map(|(a, p)| a * p).sum();
                    for (value, p) in column.iter_mut().zip(previous) {
                        *value -= dot * p;
                    }
                }
                let norm = column.iter().map(|v| v * v).sum::<f64>().sqrt().max(1e-12);
                for value in &mut column {
                    *value /= norm;
                }
                columns[j] = column;
            }
            for i in 0..dim {
                for j in 0..rank {
                    data[(b * dim + i) * rank + j] = columns[j][i] as f32;
                }
            }
        }
        data
    }
}

impl ForwardOperator for RandomProjection {
    fn name(&self) -> &str {
        "projection"
    }

    fn apply(&self, clean: &Tensor) -> interpolant::Result<Corruption> {
        let batch = clean.dim(0)?;
        let dim = clean.elem_count() / batch.max(1);
        if self.rank > dim {
            return Err(interpolant::InterpolantError::Operator(format!(
                "projection rank {} exceeds feature dimension {}",
                self.rank, dim
            )));
        }

        let mut rng = lock(&self.rng);
        let basis = self.orthonormal_basis(&mut rng, batch, dim);
        let basis = Tensor::from_vec(basis, (batch, dim, self.rank), clean.device())?;

        let column = clean.to_dtype(DType::F32)?.reshape((batch, dim, 1))?;
        let coefficients = basis.transpose(1, 2)?.contiguous()?.matmul(&column)?;
        let projected = basis.matmul(&coefficients)?.reshape(clean.dims())?;
        let mut corrupted = projected.to_dtype(clean.dtype())?;
        if self.sigma > 0.0 {
            let noise = standard_normal_like(&mut rng, clean)?;
            corrupted = (corrupted + (noise * self.sigma)?)?;
        }
        Ok(Corruption::new(corrupted, Some(basis.to_dtype(clean.dtype())?)))
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
