use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{DType, Tensor};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    path::{
        bernoulli_blend, interpolate, keep_flags, mean_squared_error, per_example,
        standard_normal_like, uniform_times,
    },
    Corruption, ForwardOperator, InterpolantError, Result, VelocityField,
};

/// Interpolant variants share this surface so the training loop and the evaluator
/// can swap them without knowing which one they hold.
pub trait Interpolant: Send + Sync {
    fn name(&self) -> &'static str;

    fn n_steps(&self) -> usize;

    fn uses_latents(&self) -> bool;

    fn forward_operator(&self) -> &dyn ForwardOperator;

    /// Maps an observation at time 1 to an estimate of its clean preimage at time 0.
    /// No gradient flows through the result.
    fn transport(
        &self,
        field: &dyn VelocityField,
        x: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<Tensor>;

    /// The `n_steps + 1` intermediate states of [`Interpolant::transport`].
    fn trajectory(
        &self,
        field: &dyn VelocityField,
        x: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<Vec<Tensor>>;

    /// Self-consistent regression loss on a batch of observations.
    fn loss(
        &self,
        field: &dyn VelocityField,
        x: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<LossOutput>;

    /// Regression loss using known clean samples as the time-0 endpoint. Used to
    /// warm-start the field before switching to the bootstrap loss.
    fn clean_loss(&self, field: &dyn VelocityField, clean: &Tensor) -> Result<LossOutput>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolantSettings {
    /// Euler steps used by transport.
    pub n_steps: usize,
    /// Probability of training on the re-corrupted pseudo-clean sample instead of
    /// the original observation.
    pub alpha: f64,
    /// Fresh corruptions drawn per loss evaluation.
    pub resamples: usize,
    pub use_latents: bool,
    pub seed: u64,
}

impl Default for InterpolantSettings {
    fn default() -> Self {
        Self {
            n_steps: 80,
            alpha: 1.0,
            resamples: 1,
            use_latents: false,
            seed: 0,
        }
    }
}

impl InterpolantSettings {
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.n_steps == 0 {
            problems.push("n_steps must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.alpha) {
            problems.push(format!("alpha must be in [0, 1] (got {})", self.alpha));
        }
        if self.resamples == 0 {
            problems.push("resamples must be at least 1".to_string());
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(InterpolantError::Config(problems.join("; ")))
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar `f32` tensor attached to the graph of the tracked velocity call.
    pub loss: Tensor,
    pub value: f64,
}

impl LossOutput {
    pub(crate) fn from_tensor(loss: Tensor) -> Result<Self> {
        let value = loss.to_dtype(DType::F32)?.to_vec0::<f32>()? as f64;
        Ok(Self { loss, value })
    }
}

/// State and regression loop shared by the interpolant variants.
pub(crate) struct EngineCore {
    pub(crate) settings: InterpolantSettings,
    pub(crate) operator: Arc<dyn ForwardOperator>,
    rng: Mutex<StdRng>,
}

impl EngineCore {
    pub(crate) fn new(
        operator: Arc<dyn ForwardOperator>,
        settings: InterpolantSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            operator,
            rng: Mutex::new(StdRng::seed_from_u64(settings.seed)),
        })
    }

    pub(crate) fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The latent the caller supplied, or `None` when latents are disabled.
    pub(crate) fn observed_latent<'a>(
        &self,
        latent: Option<&'a Tensor>,
    ) -> Result<Option<&'a Tensor>> {
        if !self.settings.use_latents {
            return Ok(None);
        }
        latent.map(Some).ok_or(InterpolantError::MissingLatent)
    }

    fn fresh_latent(&self, latent: Option<Tensor>) -> Result<Option<Tensor>> {
        if !self.settings.use_latents {
            return Ok(None);
        }
        latent.map(Some).ok_or_else(|| {
            InterpolantError::Operator(format!(
                "operator '{}' produced no latent but latents are enabled",
                self.operator.name()
            ))
        })
    }

    /// Averages the regression loss over `resamples` fresh corruptions of `x0`,
    /// falling back to the observation `x` per example with probability `1 - alpha`.
    pub(crate) fn bootstrap_loss(
        &self,
        field: &dyn VelocityField,
        x: &Tensor,
        latent: Option<&Tensor>,
        x0: &Tensor,
        bridge: Option<f64>,
    ) -> Result<LossOutput> {
        let observed_latent = self.observed_latent(latent)?;
        let batch = x.dim(0)?;
        let mut total: Option<Tensor> = None;

        for _ in 0..self.settings.resamples {
            let Corruption { corrupted, latent } = self.operator.apply(x0)?;
            let fresh_latent = self.fresh_latent(latent)?;
            let keep = keep_flags(&mut self.rng(), batch, self.settings.alpha, x.device())?;

            let x1 = bernoulli_blend(&corrupted, x, &keep)?;
            let latent1 = match (fresh_latent, observed_latent) {
                (Some(fresh), Some(observed)) => Some(bernoulli_blend(&fresh, observed, &keep)?),
                (Some(_), None) => return Err(InterpolantError::MissingLatent),
                (None, _) => None,
            };

            let term = self.regress(field, x0, &x1, latent1.as_ref(), bridge)?;
            total = Some(match total {
                Some(acc) => (acc + term)?,
                None => term,
            });
        }

        self.average(total)
    }

    pub(crate) fn clean_loss(
        &self,
        field: &dyn VelocityField,
        clean: &Tensor,
        bridge: Option<f64>,
    ) -> Result<LossOutput> {
        let mut total: Option<Tensor> = None;
        for _ in 0..self.settings.resamples {
            let Corruption { corrupted, latent } = self.operator.apply(clean)?;
            let latent = self.fresh_latent(latent)?;
            let term = self.regress(field, clean, &corrupted, latent.as_ref(), bridge)?;
            total = Some(match total {
                Some(acc) => (acc + term)?,
                None => term,
            });
        }
        self.average(total)
    }

    fn average(&self, total: Option<Tensor>) -> Result<LossOutput> {
        let total = total
            .ok_or_else(|| InterpolantError::Config("resamples must be at least 1".to_string()))?;
        let loss = (total / self.settings.resamples as f64)?;
        LossOutput::from_tensor(loss)
    }

    /// One regression term along the path from `x0` to `x1`. `bridge` adds the
    /// Brownian-bridge perturbation `eps * sqrt(t (1 - t)) * z`.
    fn regress(
        &self,
        field: &dyn VelocityField,
        x0: &Tensor,
        x1: &Tensor,
        latent: Option<&Tensor>,
        bridge: Option<f64>,
    ) -> Result<Tensor> {
        let x0 = x0.detach();
        let x1 = x1.detach().to_dtype(x0.dtype())?;
        let batch = x0.dim(0)?;
        let t = uniform_times(&mut self.rng(), batch, x0.device())?;

        let mut path = interpolate(&x0, &x1, &t)?;
        if let Some(eps) = bridge {
            let noise = standard_normal_like(&mut self.rng(), &x0)?;
            let spread = t
                .mul(&t.affine(-1.0, 1.0)?)?
                .clamp(0f32, 1f32)?
                .sqrt()?
                .affine(eps, 0.0)?
                .to_dtype(x0.dtype())?;
            path = (path + noise.broadcast_mul(&per_example(&spread, &x0)?)?)?;
        }

        let target = (&x1 - &x0)?;
        let prediction = field.velocity_tracked(&path, &t, latent)?;
        mean_squared_error(&prediction, &target)
    }
}
