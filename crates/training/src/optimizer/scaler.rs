use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{config::Precision, TrainingError};

#[derive(Debug, Clone)]
pub struct LossScaleConfig {
    pub initial_scale: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    pub growth_interval: usize,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for LossScaleConfig {
    fn default() -> Self {
        Self {
            initial_scale: 2f32.powi(15),
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 200,
            min_scale: 1.0,
            max_scale: 2f32.powi(24),
        }
    }
}

impl LossScaleConfig {
    fn sanitized(mut self) -> Self {
        if self.growth_factor < 1.0 {
            self.growth_factor = 1.0;
        }
        if !(0.0..1.0).contains(&self.backoff_factor) {
            self.backoff_factor = 0.5;
        }
        self.growth_interval = self.growth_interval.max(1);
        if self.min_scale <= 0.0 {
            self.min_scale = 1.0;
        }
        self.max_scale = self.max_scale.max(self.min_scale);
        self.initial_scale = self.initial_scale.clamp(self.min_scale, self.max_scale);
        self
    }
}

/// Persisted scaler progress; `loss_scale` is 1 when scaling is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientScalerState {
    pub enabled: bool,
    pub loss_scale: f32,
    pub stable_steps: usize,
}

/// Dynamic loss scaling for reduced-precision runs; a pass-through at `fp32`.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    config: LossScaleConfig,
    dynamic: Option<DynamicScale>,
}

#[derive(Debug, Clone, Copy)]
struct DynamicScale {
    loss_scale: f32,
    stable_steps: usize,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_config(LossScaleConfig::default(), precision)
    }

    pub fn with_config(config: LossScaleConfig, precision: Precision) -> Self {
        let config = config.sanitized();
        let dynamic = (precision != Precision::Fp32).then_some(DynamicScale {
            loss_scale: config.initial_scale,
            stable_steps: 0,
        });
        Self { config, dynamic }
    }

    pub fn is_enabled(&self) -> bool {
        self.dynamic.is_some()
    }

    pub fn loss_scale(&self) -> f32 {
        self.dynamic.map_or(1.0, |scale| scale.loss_scale)
    }

    pub fn scale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match self.dynamic {
            None => Ok(tensor.clone()),
            Some(scale) => tensor
                .affine(scale.loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn unscale(&self, tensor: &Tensor) -> Result<Tensor, TrainingError> {
        match self.dynamic {
            None => Ok(tensor.clone()),
            Some(scale) => tensor
                .affine(1.0 / scale.loss_scale as f64, 0.0)
                .map_err(to_runtime_error),
        }
    }

    pub fn has_overflow<I>(&self, tensors: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        if self.dynamic.is_none() {
            return Ok(false);
        }
        for tensor in tensors {
            if contains_non_finite(tensor.as_ref())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Backs off after an overflow, grows after `growth_interval` clean steps.
    pub fn update(&mut self, found_inf: bool) {
        let config = &self.config;
        if let Some(scale) = self.dynamic.as_mut() {
            if found_inf {
                scale.loss_scale = (scale.loss_scale * config.backoff_factor).max(config.min_scale);
                scale.stable_steps = 0;
            } else {
                scale.stable_steps += 1;
                if scale.stable_steps >= config.growth_interval {
                    scale.loss_scale =
                        (scale.loss_scale * config.growth_factor).min(config.max_scale);
                    scale.stable_steps = 0;
                }
            }
        }
    }

    pub fn state(&self) -> GradientScalerState {
        GradientScalerState {
            enabled: self.is_enabled(),
            loss_scale: self.loss_scale(),
            stable_steps: self.dynamic.map_or(0, |scale| scale.stable_steps),
        }
    }

    pub fn load_state(&mut self, state: GradientScalerState) {
        match self.dynamic.as_mut() {
            Some(scale) if state.enabled => {
                scale.loss_scale = state
                    .loss_scale
                    .clamp(self.config.min_scale, self.config.max_scale);
                scale.stable_steps = state.stable_steps;
            }
            Some(_) => log::warn!("checkpoint was trained without loss scaling; keeping defaults"),
            None if state.enabled => {
                log::warn!("ignoring loss-scale state: this run uses fp32")
            }
            None => {}
        }
    }
}

pub(crate) fn contains_non_finite(tensor: &Tensor) -> Result<bool, TrainingError> {
    if tensor.elem_count() == 0 {
        return Ok(false);
    }
    let sum = tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.sqr())
        .and_then(|t| t.sum_all())
        .and_then(|t| t.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(!sum.is_finite())
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
