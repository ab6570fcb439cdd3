use std::sync::Arc;

use candle_core::Tensor;

use crate::{
    engine::EngineCore,
    path::{ensure_same_shape, standard_normal_like},
    transport::{time_column, validate_steps},
    ForwardOperator, Interpolant, InterpolantError, InterpolantSettings, LossOutput, Result,
    VelocityField,
};

/// Stochastic-bridge variant of the deconvolving interpolant.
///
/// The training path carries Brownian-bridge noise,
/// `I_t = (1 - t) x0 + t x1 + eps * sqrt(t (1 - t)) * z`, and transport runs the
/// reverse bridge: each Euler step from `t` to `s = t - dt` adds noise with
/// standard deviation `eps * sqrt(dt * s / t)`, which vanishes on the last step.
pub struct FollmerInterpolant {
    core: EngineCore,
    diffusion_coef: f64,
}

impl FollmerInterpolant {
    pub fn new(
        operator: Arc<dyn ForwardOperator>,
        settings: InterpolantSettings,
        diffusion_coef: f64,
    ) -> Result<Self> {
        if !(diffusion_coef.is_finite() && diffusion_coef >= 0.0) {
            return Err(InterpolantError::Config(format!(
                "diffusion coefficient must be finite and non-negative (got {diffusion_coef})"
            )));
        }
        Ok(Self {
            core: EngineCore::new(operator, settings)?,
            diffusion_coef,
        })
    }

    pub fn diffusion_coef(&self) -> f64 {
        self.diffusion_coef
    }

    fn integrate<F>(
        &self,
        field: &dyn VelocityField,
        x: &Tensor,
        latent: Option<&Tensor>,
        mut record: F,
    ) -> Result<Tensor>
    where
        F: FnMut(&Tensor),
    {
        let steps = self.core.settings.n_steps;
        validate_steps(steps)?;
        let latent = self.core.observed_latent(latent)?;
        let batch = x.dim(0)?;
        let dt = 1.0 / steps as f64;

        let mut state = x.detach();
        for i in 1..=steps {
            let t = 1.0 - (i - 1) as f64 * dt;
            let time = time_column(t, batch, x)?;
            let velocity = field.velocity_detached(&state, &time, latent)?;
            ensure_same_shape(&velocity, &state, "velocity field output")?;
            state = (state - (velocity.to_dtype(x.dtype())? * dt)?)?;

            if i < steps && self.diffusion_coef > 0.0 {
                let s = (t - dt).max(0.0);
                let std = self.diffusion_coef * (dt * s / t).sqrt();
                let noise = standard_normal_like(&mut self.core.rng(), &state)?;
                state = (state + (noise * std)?)?;
            }
            record(&state);
        }
        Ok(state)
    }
}

impl Interpolant for FollmerInterpolant {
    fn name(&self) -> &'static str {
        "follmer"
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
        self.integrate(field, x, latent, |_| {})
    }

    fn trajectory(
        &self,
        field: &dyn VelocityField,
        x: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<Vec<Tensor>> {
        let mut states = vec![x.detach()];
        self.integrate(field, x, latent, |state| states.push(state.clone()))?;
        Ok(states)
    }

    fn loss(
        &self,
        field: &dyn VelocityField,
        x: &Tensor,
        latent: Option<&Tensor>,
    ) -> Result<LossOutput> {
        let x0 = self.transport(field, x, latent)?;
        self.core
            .bootstrap_loss(field, x, latent, &x0, Some(self.diffusion_coef))
    }

    fn clean_loss(&self, field: &dyn VelocityField, clean: &Tensor) -> Result<LossOutput> {
        self.core.clean_loss(field, clean, Some(self.diffusion_coef))
    }
}
