use std::sync::Arc;

use candle_core::Tensor;

use crate::{
    engine::EngineCore, euler_trajectory, euler_transport, ForwardOperator, Interpolant,
    InterpolantSettings, LossOutput, Result, VelocityField,
};

/// Deterministic deconvolving interpolant.
///
/// Training pairs are manufactured from observations alone: `x0 = transport(x)` is
/// the model's current guess of the clean sample, `x1 = A(x0)` re-corrupts it, and
/// the field regresses `x1 - x0` along `(1 - t) x0 + t x1`. At a fixed point the
/// transported observations are distributed like the clean data.
pub struct DeconvolvingInterpolant {
    core: EngineCore,
}

impl DeconvolvingInterpolant {
    pub fn new(operator: Arc<dyn ForwardOperator>, settings: InterpolantSettings) -> Result<Self> {
        if settings.use_latents {
            log::info!(
                "deconvolving interpolant conditions on latents from '{}'",
                operator.name()
            );
        }
        Ok(Self {
            core: EngineCore::new(operator, settings)?,
        })
    }

    pub fn settings(&self) -> &InterpolantSettings {
        &self.core.settings
    }
}

impl Interpolant for DeconvolvingInterpolant {
    fn name(&self) -> &'static str {
        "deconvolving"
    }

    fn n_steps(&self) -> usize {
        self.core.settings.n_steps
    }

    fn uses_latents(&self) -> bool {
        self.core.settings.use_latents
    }

    fn forward_operator(&self) -> &dyn ForwardOperator {
        self.core.operator.as_ref()
    }

    fn transport(
        &self,
        field: &dyn VelocityField,
        x: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<Tensor> {
        let latent = self.core.observed_latent(latent)?;
        euler_transport(field, x, latent, self.core.settings.n_steps)
    }

    fn trajectory(
        &self,
        field: &dyn VelocityField,
        x: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<Vec<Tensor>> {
        let latent = self.core.observed_latent(latent)?;
        euler_trajectory(field, x, latent, self.core.settings.n_steps)
    }

    fn loss(
        &self,
        field: &dyn VelocityField,
        x: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<LossOutput> {
        let x0 = self.transport(field, x, latent)?;
        self.core.bootstrap_loss(field, x, latent, &x0, None)
    }

    fn clean_loss(&self, field: &dyn VelocityField, clean: &Tensor) -> Result<LossOutput> {
        self.core.clean_loss(field, clean, None)
    }
}
