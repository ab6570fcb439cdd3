//! Feed-forward velocity field with a sinusoidal time embedding.
//!
//! Architecture: `[flatten(x) | emb(t) | flatten(latent)] → (Linear → SiLU) × depth → Linear`,
//! reshaped back to the shape of `x`.

use std::sync::MutexGuard;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};
use interpolant::VelocityField;

use crate::{embedding::sinusoidal_embedding, VelocityModel};

#[derive(Debug, Clone, PartialEq)]
pub struct FeedForwardConfig {
    /// Number of features per example after flattening the sample.
    pub input_dim: usize,
    pub time_embedding_dim: usize,
    pub hidden_widths: Vec<usize>,
    /// Flattened latent width when the field is conditioned on latents.
    pub latent_dim: Option<usize>,
    pub dtype: DType,
}

impl Default for FeedForwardConfig {
    fn default() -> Self {
        Self {
            input_dim: 2,
            time_embedding_dim: 64,
            hidden_widths: vec![256; 3],
            latent_dim: None,
            dtype: DType::F32,
        }
    }
}

pub struct FeedForwardVelocity {
    var_map: VarMap,
    hidden: Vec<Linear>,
    output: Linear,
    config: FeedForwardConfig,
    device: Device,
}

impl std::fmt::Debug for FeedForwardVelocity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FeedForwardVelocity({}+{}{} → {:?} → {}, device={:?})",
            self.config.input_dim,
            self.config.time_embedding_dim,
            self.config
                .latent_dim
                .map(|dim| format!("+{dim}"))
                .unwrap_or_default(),
            self.config.hidden_widths,
            self.config.input_dim,
            self.device
        )
    }
}

impl FeedForwardVelocity {
    pub fn new(config: FeedForwardConfig, device: &Device) -> Result<Self> {
        if config.input_dim == 0 {
            candle_core::bail!("feed-forward velocity requires input_dim > 0");
        }
        if config.time_embedding_dim < 2 || config.time_embedding_dim % 2 != 0 {
            candle_core::bail!(
                "time_embedding_dim must be even and >= 2 (got {})",
                config.time_embedding_dim
            );
        }

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, config.dtype, device);

        let mut width =
            config.input_dim + config.time_embedding_dim + config.latent_dim.unwrap_or(0);
        let mut hidden = Vec::with_capacity(config.hidden_widths.len());
        for (idx, &next) in config.hidden_widths.iter().enumerate() {
            hidden.push(linear(width, next, vb.pp(format!("hidden.{idx}")))?);
            width = next;
        }
        let output = linear(width, config.input_dim, vb.pp("output"))?;

        let model = Self {
            var_map,
            hidden,
            output,
            config,
            device: device.clone(),
        };
        log::debug!("built {model:?} with {} parameters", model.parameter_count());
        Ok(model)
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Copies parameter values by name from `source` into this model.
    pub fn load_parameters(&self, source: &[(String, Var)]) -> Result<()> {
        let vars = self.vars();
        for (name, value) in source {
            let Some(target) = vars.get(name) else {
                log::warn!("refusing to load unknown parameter '{name}'");
                candle_core::bail!("unknown parameter '{name}'");
            };
            target.set(&value.as_tensor().to_dtype(target.dtype())?)?;
        }
        Ok(())
    }

    fn vars(&self) -> MutexGuard<'_, std::collections::HashMap<String, Var>> {
        self.var_map
            .data()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl VelocityField for FeedForwardVelocity {
    fn forward(&self, state: &Tensor, time: &Tensor, latent: Option<&Tensor>) -> Result<Tensor> {
        let batch = state.dim(0)?;
        let flat = state.reshape((batch, ()))?;
        if flat.dim(1)? != self.config.input_dim {
            candle_core::bail!(
                "expected {} features per example, got {}",
                self.config.input_dim,
                flat.dim(1)?
            );
        }

        let mut inputs = vec![
            flat.to_dtype(self.config.dtype)?,
            sinusoidal_embedding(time, self.config.time_embedding_dim)?
                .to_dtype(self.config.dtype)?,
        ];
        match (self.config.latent_dim, latent) {
            (Some(dim), Some(latent)) => {
                let latent = latent.reshape((batch, ()))?;
                if latent.dim(1)? != dim {
                    candle_core::bail!("expected latent width {dim}, got {}", latent.dim(1)?);
                }
                inputs.push(latent.to_dtype(self.config.dtype)?);
            }
            (Some(_), None) => {
                candle_core::bail!("velocity field was built to condition on latents")
            }
            (None, _) => {}
        }

        let mut hidden = Tensor::cat(&inputs, 1)?;
        for layer in &self.hidden {
            hidden = candle_nn::ops::silu(&layer.forward(&hidden)?)?;
        }
        self.output
            .forward(&hidden)?
            .to_dtype(state.dtype())?
            .reshape(state.shape())
    }
}

impl VelocityModel for FeedForwardVelocity {
    fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params: Vec<(String, Var)> = self
            .vars()
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    fn fork(&self) -> Result<Self> {
        let copy = Self::new(self.config.clone(), &self.device)?;
        copy.load_parameters(&self.named_parameters())?;
        Ok(copy)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}
