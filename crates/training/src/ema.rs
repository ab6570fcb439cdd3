use std::collections::HashMap;

use candle_core::Var;
use serde::{Deserialize, Serialize};
use velocity::VelocityModel;

use crate::TrainingError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmaState {
    pub decay: f64,
    pub update_every: usize,
    /// Commits observed since the shadow was created.
    pub calls: usize,
    /// Interpolation events actually applied.
    pub updates: usize,
}

/// Exponential moving average of a model's parameters, kept in an independently
/// owned copy of the model. Every `update_every`-th call moves each shadow
/// parameter toward the live one: `shadow ← decay·shadow + (1 - decay)·live`.
pub struct EmaModel<M: VelocityModel> {
    shadow: M,
    state: EmaState,
}

impl<M: VelocityModel> EmaModel<M> {
    pub fn new(live: &M, decay: f64, update_every: usize) -> Result<Self, TrainingError> {
        if !(0.0..1.0).contains(&decay) {
            return Err(TrainingError::initialization(format!(
                "ema decay must be in [0, 1) (got {decay})"
            )));
        }
        let shadow = live.fork().map_err(|err| {
            TrainingError::initialization(format!("failed to copy model for ema: {err}"))
        })?;
        Ok(Self {
            shadow,
            state: EmaState {
                decay,
                update_every: update_every.max(1),
                calls: 0,
                updates: 0,
            },
        })
    }

    pub fn model(&self) -> &M {
        &self.shadow
    }

    pub fn state(&self) -> EmaState {
        self.state
    }

    pub fn load_state(&mut self, state: EmaState) {
        if state.decay != self.state.decay || state.update_every != self.state.update_every {
            log::warn!(
                "ema settings differ from checkpoint (decay {} -> {}, update_every {} -> {})",
                state.decay,
                self.state.decay,
                state.update_every,
                self.state.update_every
            );
        }
        self.state.calls = state.calls;
        self.state.updates = state.updates;
    }

    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        self.shadow.named_parameters()
    }

    /// Records one committed step; returns whether the shadow moved.
    pub fn update(&mut self, live: &M) -> Result<bool, TrainingError> {
        self.state.calls += 1;
        if self.state.calls % self.state.update_every != 0 {
            return Ok(false);
        }

        let live: HashMap<String, Var> = live.named_parameters().into_iter().collect();
        let decay = self.state.decay;
        for (name, shadow) in self.shadow.named_parameters() {
            let current = live.get(&name).ok_or_else(|| {
                TrainingError::runtime(format!("ema shadow parameter '{name}' missing from model"))
            })?;
            let blended = shadow
                .as_tensor()
                .affine(decay, 0.0)
                .and_then(|kept| {
                    current
                        .as_tensor()
                        .detach()
                        .to_dtype(kept.dtype())?
                        .affine(1.0 - decay, 0.0)?
                        .add(&kept)
                })
                .map_err(|err| TrainingError::runtime(format!("ema update failed: {err}")))?;
            shadow
                .set(&blended)
                .map_err(|err| TrainingError::runtime(format!("ema update failed: {err}")))?;
        }
        self.state.updates += 1;
        Ok(true)
    }
}
