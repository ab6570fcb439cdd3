use std::collections::HashMap;

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

const EPS: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Decoupled weight decay; zero for plain Adam.
    pub weight_decay: f64,
}

impl From<&config::OptimizerConfig> for AdamConfig {
    fn from(value: &config::OptimizerConfig) -> Self {
        let weight_decay = match value.algorithm {
            config::OptimizerType::Adam => 0.0,
            config::OptimizerType::AdamW => value.weight_decay,
        };
        Self {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrainerOptimizerOptions {
    pub clip_global_norm: Option<f64>,
    pub weight_decay_exclude: Vec<String>,
}

impl From<&config::OptimizerConfig> for TrainerOptimizerOptions {
    fn from(value: &config::OptimizerConfig) -> Self {
        Self {
            clip_global_norm: value.max_grad_norm,
            weight_decay_exclude: value.weight_decay_exclude.clone(),
        }
    }
}

/// Adam with decoupled weight decay and global-norm clipping. Moments live in
/// `f32`; parameters stored in a narrower type get an `f32` master copy.
#[derive(Debug)]
pub struct TrainerOptimizer {
    config: AdamConfig,
    params: Vec<ParameterSlot>,
    step: usize,
    clip_global_norm: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
    apply_weight_decay: bool,
}

impl ParameterSlot {
    fn zero_moments(&mut self) -> candle_core::Result<()> {
        let tensor = self.param.as_tensor();
        self.first_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?;
        self.second_moment = Tensor::zeros(tensor.dims(), DType::F32, tensor.device())?;
        Ok(())
    }

    fn write(&self, next: &Tensor) -> candle_core::Result<()> {
        if let Some(master) = &self.master {
            master.set(next)?;
        }
        if self.dtype == DType::F32 {
            self.param.set(next)
        } else {
            self.param.set(&next.to_dtype(self.dtype)?)
        }
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: AdamConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let dtype = tensor.dtype();
            let master = if dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };
            let apply_weight_decay = !options
                .weight_decay_exclude
                .iter()
                .any(|pattern| !pattern.is_empty() && name.contains(pattern.as_str()));

            let zeros = || {
                Tensor::zeros(tensor.dims(), DType::F32, tensor.device()).map_err(to_runtime_error)
            };
            let (first_moment, second_moment) = (zeros()?, zeros()?);
            params.push(ParameterSlot {
                name,
                param: var.clone(),
                dtype,
                master,
                first_moment,
                second_moment,
                apply_weight_decay,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
            clip_global_norm: options.clip_global_norm,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Applies one update from `grads`, consuming the gradients it uses.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        let mut processed = Vec::new();
        let mut total_norm_sq = 0.0f64;
        for (index, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            total_norm_sq += squared_norm(&grad)?;
            processed.push(ProcessedGradient { index, grad });
        }

        if processed.is_empty() {
            return Ok(());
        }

        if let Some(max_norm) = self.clip_global_norm {
            let total_norm = total_norm_sq.sqrt();
            if total_norm > max_norm {
                let scale = max_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                }
            }
        }

        self.step += 1;
        self.apply_adam(processed).map_err(to_runtime_error)
    }

    fn apply_adam(&mut self, processed: Vec<ProcessedGradient>) -> candle_core::Result<()> {
        let cfg = self.config;
        let scale_m = bias_correction(cfg.beta1, self.step);
        let scale_v = bias_correction(cfg.beta2, self.step);

        for ProcessedGradient { index, grad } in processed {
            let slot = &mut self.params[index];

            let m = (slot.first_moment.affine(cfg.beta1, 0.0)?
                + grad.affine(1.0 - cfg.beta1, 0.0)?)?;
            let v = (slot.second_moment.affine(cfg.beta2, 0.0)?
                + grad.sqr()?.affine(1.0 - cfg.beta2, 0.0)?)?;

            let denom = v.affine(scale_v, 0.0)?.sqrt()?.affine(1.0, cfg.epsilon)?;
            let update = m
                .affine(scale_m, 0.0)?
                .div(&denom)?
                .affine(cfg.learning_rate, 0.0)?;

            let base = match &slot.master {
                Some(master) => master.as_tensor().clone(),
                None => slot.param.as_tensor().to_dtype(DType::F32)?,
            };
            let base = if slot.apply_weight_decay && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)?
            } else {
                base
            };

            slot.write(&base.sub(&update)?)?;
            slot.first_moment = m;
            slot.second_moment = v;
        }
        Ok(())
    }

    pub fn zero_grad(&self, grads: &mut GradStore) {
        for slot in &self.params {
            let _ = grads.remove(slot.param.as_tensor());
        }
    }

    /// Forgets all moment estimates and re-syncs master weights from the parameters.
    pub fn reset_state(&mut self) -> Result<(), TrainingError> {
        self.step = 0;
        for slot in &mut self.params {
            slot.zero_moments().map_err(to_runtime_error)?;
            if let Some(master) = &slot.master {
                let fp32 = slot
                    .param
                    .as_tensor()
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?;
                master.set(&fp32).map_err(to_runtime_error)?;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> Result<OptimizerState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let master = match &slot.master {
                Some(master) => Some(flatten(master.as_tensor())?),
                None => None,
            };
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape: slot.param.as_tensor().dims().to_vec(),
                first_moment: flatten(&slot.first_moment)?,
                second_moment: flatten(&slot.second_moment)?,
                master,
            });
        }

        Ok(OptimizerState {
            step: self.step,
            parameters,
        })
    }

    /// Restores moments by parameter name. Master weights are restored too, but
    /// the live parameters are left alone: they come from the model weights file.
    pub fn load_state(&mut self, state: OptimizerState) -> Result<(), TrainingError> {
        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let saved = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            if dims != saved.shape {
                return Err(TrainingError::runtime(format!(
                    "optimizer state shape mismatch for '{}': {:?} vs {:?}",
                    slot.name, saved.shape, dims
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            let restore = |values: Vec<f32>| -> Result<Tensor, TrainingError> {
                if values.len() != dims.iter().product::<usize>() {
                    return Err(TrainingError::runtime(format!(
                        "optimizer state size mismatch for '{}'",
                        slot.name
                    )));
                }
                Tensor::from_vec(values, dims.as_slice(), &device).map_err(to_runtime_error)
            };

            let first_moment = restore(saved.first_moment)?;
            let second_moment = restore(saved.second_moment)?;
            match (&slot.master, saved.master) {
                (Some(master), Some(values)) => {
                    master.set(&restore(values)?).map_err(to_runtime_error)?;
                }
                (Some(master), None) => {
                    let fp32 = slot
                        .param
                        .as_tensor()
                        .to_dtype(DType::F32)
                        .map_err(to_runtime_error)?;
                    master.set(&fp32).map_err(to_runtime_error)?;
                }
                (None, _) => {}
            }
            slot.first_moment = first_moment;
            slot.second_moment = second_moment;
        }

        if !by_name.is_empty() {
            let mut extra: Vec<String> = by_name.into_keys().collect();
            extra.sort();
            return Err(TrainingError::runtime(format!(
                "optimizer state has parameters not present in the model: {}",
                extra.join(", ")
            )));
        }

        self.step = state.step;
        Ok(())
    }
}

fn bias_correction(beta: f64, step: usize) -> f64 {
    let correction = 1.0 - beta.powi(step as i32);
    if correction.abs() < EPS {
        1.0
    } else {
        1.0 / correction
    }
}

fn squared_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let value = tensor
        .sqr()
        .and_then(|sq| sq.sum_all())
        .and_then(|sum| sum.to_vec0::<f32>())
        .map_err(to_runtime_error)?;
    Ok(value as f64)
}

fn flatten(tensor: &Tensor) -> Result<Vec<f32>, TrainingError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(to_runtime_error)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
    pub master: Option<Vec<f32>>,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn optimizer(clip: Option<f64>) -> (Var, TrainerOptimizer) {
        let var = Var::new(&[1.0f32, -2.0], &Device::Cpu).unwrap();
        let optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            AdamConfig {
                learning_rate: 0.1,
                beta1: 0.9,
                beta2: 0.999,
                epsilon: 1e-8,
                weight_decay: 0.0,
            },
            TrainerOptimizerOptions {
                clip_global_norm: clip,
                weight_decay_exclude: vec![],
            },
        )
        .unwrap();
        (var, optimizer)
    }

    #[test]
    fn first_step_moves_each_coordinate_by_the_learning_rate() {
        let (var, mut optimizer) = optimizer(None);
        let mut grads = var.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        let values = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] - 0.9).abs() < 1e-5);
        assert!((values[1] + 1.9).abs() < 1e-5);
        assert_eq!(optimizer.steps_taken(), 1);
    }

    #[test]
    fn state_round_trips_and_reset_clears_moments() {
        let (var, mut optimizer) = optimizer(Some(1.0));
        let mut grads = var.as_tensor().sum_all().unwrap().backward().unwrap();
        optimizer.step(&mut grads).unwrap();
        let saved = optimizer.state().unwrap();
        assert!(saved.parameters[0].first_moment.iter().all(|m| *m != 0.0));

        optimizer.reset_state().unwrap();
        let cleared = optimizer.state().unwrap();
        assert_eq!(cleared.step, 0);
        assert!(cleared.parameters[0].first_moment.iter().all(|m| *m == 0.0));

        optimizer.load_state(saved.clone()).unwrap();
        let restored = optimizer.state().unwrap();
        assert_eq!(restored.step, 1);
        assert_eq!(restored.parameters[0].first_moment, saved.parameters[0].first_moment);
    }
}
