use std::{collections::HashMap, fs, path::Path};

use anyhow::Result;
use candle_core::{DType, Device, Tensor, Var};
use tempfile::tempdir;
use training::{
    checkpoint::{
        apply_weights, load_checkpoint, load_inference_weights, resolve_checkpoint,
        save_checkpoint, EmaSnapshot, SaveRequest,
    },
    optimizer::{AdamConfig, GradientScaler},
    EmaModel, Milestone, TrainerOptimizer, TrainerOptimizerOptions, TrainingConfig,
};
use velocity::{FeedForwardConfig, FeedForwardVelocity, VelocityModel};

fn config() -> TrainingConfig {
    toml::from_str("[corruption]\nname = \"gaussian_noise\"\nlevels = [0.1]\n").unwrap()
}

fn model() -> FeedForwardVelocity {
    FeedForwardVelocity::new(
        FeedForwardConfig {
            input_dim: 2,
            time_embedding_dim: 4,
            hidden_widths: vec![8],
            latent_dim: None,
            dtype: DType::F32,
        },
        &Device::Cpu,
    )
    .unwrap()
}

fn values(parameters: &[(String, Var)]) -> HashMap<String, Vec<f32>> {
    parameters
        .iter()
        .map(|(name, var)| {
            let flat = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            (name.clone(), flat)
        })
        .collect()
}

fn save(
    results_dir: &Path,
    milestone: Milestone,
    model: &FeedForwardVelocity,
    ema: Option<&EmaModel<FeedForwardVelocity>>,
    step: usize,
    loss: Option<f64>,
) -> Result<()> {
    let config = config();
    let optimizer = TrainerOptimizer::new(
        model.named_parameters(),
        AdamConfig::from(&config.optimizer),
        TrainerOptimizerOptions::default(),
    )?;
    let scaler = GradientScaler::new(config.runtime.precision);
    save_checkpoint(SaveRequest {
        results_dir,
        milestone,
        config: &config,
        parameters: model.named_parameters(),
        ema: ema.map(|ema| EmaSnapshot {
            parameters: ema.named_parameters(),
            state: ema.state(),
        }),
        optimizer: &optimizer,
        scheduler: None,
        scaler: &scaler,
        step,
        loss,
    })?;
    Ok(())
}

#[test]
fn saved_checkpoint_restores_into_a_fresh_model() -> Result<()> {
    let dir = tempdir()?;
    let trained = model();
    let ema = EmaModel::new(&trained, 0.9, 1)?;
    save(dir.path(), Milestone::Best, &trained, Some(&ema), 12, Some(0.5))?;

    let checkpoint_dir = dir.path().join("model-best");
    assert!(checkpoint_dir.join("manifest.json").is_file());
    assert!(!dir.path().join(".model-best.partial").exists());

    let outcome = load_checkpoint(&checkpoint_dir)?;
    assert_eq!(outcome.manifest.step, 12);
    assert_eq!(outcome.manifest.loss, Some(0.5));
    assert_eq!(outcome.manifest.milestone, "best");
    assert!(outcome.ema_weights_path.is_some());
    assert_eq!(outcome.ema_state.map(|state| state.decay), Some(0.9));
    assert!(outcome.optimizer_state.is_some());
    assert!(outcome.scheduler_state.is_none());
    assert!(outcome.scaler_state.is_some());

    let fresh = model();
    assert_ne!(values(&fresh.named_parameters()), values(&trained.named_parameters()));
    apply_weights(
        &fresh.named_parameters(),
        &outcome.model_weights_path,
        &Device::Cpu,
    )?;
    assert_eq!(values(&fresh.named_parameters()), values(&trained.named_parameters()));
    Ok(())
}

#[test]
fn milestones_resolve_by_name_or_directory() -> Result<()> {
    let dir = tempdir()?;
    let trained = model();
    save(dir.path(), Milestone::Latest, &trained, None, 3, None)?;
    save(dir.path(), Milestone::Step(3), &trained, None, 3, None)?;

    let latest = dir.path().join("model-latest");
    assert_eq!(resolve_checkpoint(dir.path(), "latest")?, latest);
    assert_eq!(resolve_checkpoint(dir.path(), "3")?, dir.path().join("model-3"));
    let by_path = latest.to_string_lossy().into_owned();
    assert_eq!(resolve_checkpoint(dir.path(), &by_path)?, latest);
    assert!(resolve_checkpoint(dir.path(), "best").is_err());
    assert!(resolve_checkpoint(dir.path(), "newest").is_err());

    // Saving the same milestone again replaces the directory.
    save(dir.path(), Milestone::Latest, &trained, None, 4, None)?;
    assert_eq!(load_checkpoint(&latest)?.manifest.step, 4);
    assert!(!dir.path().join(".model-latest.previous").exists());
    Ok(())
}

#[test]
fn interrupted_replacement_keeps_the_previous_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let trained = model();
    save(dir.path(), Milestone::Best, &trained, None, 2, Some(0.3))?;

    // State after the old directory was moved aside but before the new one landed.
    let best = dir.path().join("model-best");
    let previous = dir.path().join(".model-best.previous");
    fs::rename(&best, &previous)?;
    fs::create_dir(dir.path().join(".model-best.partial"))?;

    let located = resolve_checkpoint(dir.path(), "best")?;
    assert_eq!(located, previous);
    assert_eq!(load_checkpoint(&located)?.manifest.step, 2);

    save(dir.path(), Milestone::Best, &trained, None, 5, Some(0.2))?;
    assert_eq!(resolve_checkpoint(dir.path(), "best")?, best);
    assert_eq!(load_checkpoint(&best)?.manifest.step, 5);
    assert!(!previous.exists());
    assert!(!dir.path().join(".model-best.partial").exists());
    Ok(())
}

#[test]
fn inference_weights_fall_back_to_the_live_model() -> Result<()> {
    let dir = tempdir()?;
    let trained = model();
    save(dir.path(), Milestone::Latest, &trained, None, 1, Some(1.0))?;

    let fresh = model();
    let outcome = load_inference_weights(
        &dir.path().join("model-latest"),
        &fresh.named_parameters(),
        &Device::Cpu,
        true,
    )?;
    assert!(outcome.ema_weights_path.is_none());
    assert_eq!(values(&fresh.named_parameters()), values(&trained.named_parameters()));
    Ok(())
}

#[test]
fn wrapper_prefixes_are_ignored_and_extras_rejected() -> Result<()> {
    let dir = tempdir()?;
    let trained = model();
    let prefixed: HashMap<String, Tensor> = trained
        .named_parameters()
        .into_iter()
        .map(|(name, var)| (format!("_orig_mod.module.{name}"), var.as_tensor().clone()))
        .collect();
    let path = dir.path().join("wrapped.safetensors");
    candle_core::safetensors::save(&prefixed, &path)?;

    let fresh = model();
    apply_weights(&fresh.named_parameters(), &path, &Device::Cpu)?;
    assert_eq!(values(&fresh.named_parameters()), values(&trained.named_parameters()));

    let mut extra = prefixed.clone();
    extra.insert("stray.weight".to_string(), Tensor::zeros(2, DType::F32, &Device::Cpu)?);
    let extra_path = dir.path().join("extra.safetensors");
    candle_core::safetensors::save(&extra, &extra_path)?;
    assert!(apply_weights(&fresh.named_parameters(), &extra_path, &Device::Cpu).is_err());
    Ok(())
}

#[test]
fn corrupted_files_fail_checksum_validation() -> Result<()> {
    let dir = tempdir()?;
    let trained = model();
    save(dir.path(), Milestone::Best, &trained, None, 2, Some(0.1))?;

    let checkpoint_dir = dir.path().join("model-best");
    fs::write(checkpoint_dir.join("optimizer.json"), b"{}")?;
    assert!(load_checkpoint(&checkpoint_dir).is_err());
    Ok(())
}
