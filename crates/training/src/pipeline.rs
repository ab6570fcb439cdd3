//! Turns a [`TrainingConfig`] into the pieces a run is assembled from. The
//! trainer and the evaluator both go through here so a checkpoint is always
//! rebuilt with the architecture it was trained with.

use std::sync::Arc;

use candle_core::Device;
use interpolant::{
    DeconvolvingInterpolant, FollmerInterpolant, ForwardOperator, Interpolant,
    InterpolantSettings,
};
use inverse_data::{CleanSource, CorruptionKind};
use velocity::{FeedForwardConfig, FeedForwardVelocity};

use crate::{config::InterpolantVariant, TrainingConfig, TrainingError};

// Offsets keep the RNG streams of each component independent for one run seed.
const OPERATOR_SEED_OFFSET: u64 = 1;
const INTERPOLANT_SEED_OFFSET: u64 = 2;
const RANK_SEED_STRIDE: u64 = 1_000;

/// The model and the data side of a run.
pub struct Components<M> {
    pub model: M,
    pub interpolant: Arc<dyn Interpolant>,
    /// Operator used by the data loader to corrupt clean samples.
    pub operator: Arc<dyn ForwardOperator>,
    pub source: Arc<dyn CleanSource>,
}

pub fn build_source(
    config: &TrainingConfig,
    rank: usize,
) -> Result<Arc<dyn CleanSource>, TrainingError> {
    let source = inverse_data::build_source(
        &config.data.dataset,
        config.data.path.as_deref(),
        rank_seed(config.runtime.seed, rank),
    )?;
    Ok(Arc::from(source))
}

pub fn build_operator(
    config: &TrainingConfig,
    seed_offset: u64,
) -> Result<Arc<dyn ForwardOperator>, TrainingError> {
    let seed = config
        .runtime
        .seed
        .wrapping_add(OPERATOR_SEED_OFFSET)
        .wrapping_add(seed_offset);
    Ok(inverse_data::build_operator(
        &config.corruption.name,
        &config.corruption.levels,
        seed,
    )?)
}

/// Whether the velocity field is conditioned on operator latents. An explicit
/// setting wins; otherwise latents are used whenever the operator has them.
pub fn uses_latents(config: &TrainingConfig) -> Result<bool, TrainingError> {
    let kind = CorruptionKind::parse(&config.corruption.name)?;
    match config.interpolant.use_latents {
        Some(true) if !kind.uses_latents() => Err(TrainingError::initialization(format!(
            "corruption '{}' has no latents to condition on",
            kind.as_str()
        ))),
        Some(explicit) => Ok(explicit),
        None => Ok(kind.uses_latents()),
    }
}

pub fn latent_dim(
    config: &TrainingConfig,
    feature_dim: usize,
) -> Result<Option<usize>, TrainingError> {
    if !uses_latents(config)? {
        return Ok(None);
    }
    let kind = CorruptionKind::parse(&config.corruption.name)?;
    Ok(kind.latent_dim(&config.corruption.levels, feature_dim))
}

pub fn build_interpolant(
    config: &TrainingConfig,
    operator: Arc<dyn ForwardOperator>,
    rank: usize,
) -> Result<Arc<dyn Interpolant>, TrainingError> {
    let settings = InterpolantSettings {
        n_steps: config.interpolant.n_steps,
        alpha: config.interpolant.alpha,
        resamples: config.interpolant.resamples,
        use_latents: uses_latents(config)?,
        seed: rank_seed(config.runtime.seed, rank).wrapping_add(INTERPOLANT_SEED_OFFSET),
    };
    let interpolant: Arc<dyn Interpolant> = match config.interpolant.variant {
        InterpolantVariant::Deconvolving => {
            Arc::new(DeconvolvingInterpolant::new(operator, settings)?)
        }
        InterpolantVariant::Follmer => {
            let eps = config.interpolant.diffusion_coef.ok_or_else(|| {
                TrainingError::initialization("follmer interpolant needs a diffusion_coef")
            })?;
            Arc::new(FollmerInterpolant::new(operator, settings, eps)?)
        }
    };
    Ok(interpolant)
}

pub fn build_model(
    config: &TrainingConfig,
    feature_dim: usize,
    device: &Device,
) -> Result<FeedForwardVelocity, TrainingError> {
    let model_config = FeedForwardConfig {
        input_dim: feature_dim,
        time_embedding_dim: config.model.time_embedding_dim,
        hidden_widths: vec![config.model.width; config.model.depth],
        latent_dim: latent_dim(config, feature_dim)?,
        dtype: config.model_dtype(),
    };
    FeedForwardVelocity::new(model_config, device).map_err(|err| {
        TrainingError::initialization(format!("failed to build velocity model: {err}"))
    })
}

/// Everything a feed-forward run needs, with per-rank RNG streams.
pub fn default_components(
    config: &TrainingConfig,
    rank: usize,
    device: &Device,
) -> Result<Components<FeedForwardVelocity>, TrainingError> {
    let source = build_source(config, rank)?;
    let offset = rank as u64 * RANK_SEED_STRIDE;
    let operator = build_operator(config, offset)?;
    // The interpolant re-corrupts with its own operator stream.
    let interpolant_operator = build_operator(config, offset + INTERPOLANT_SEED_OFFSET)?;
    let interpolant = build_interpolant(config, interpolant_operator, rank)?;
    let model = build_model(config, source.feature_dim(), device)?;
    Ok(Components {
        model,
        interpolant,
        operator,
        source,
    })
}

fn rank_seed(seed: u64, rank: usize) -> u64 {
    seed.wrapping_add(rank as u64 * RANK_SEED_STRIDE)
}
