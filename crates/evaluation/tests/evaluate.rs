use std::{
    fs,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use candle_core::{Device, Tensor};
use evaluation::{
    EvaluationSettings, Evaluator, FeatureExtractor, FlattenExtractor, ReferenceCache,
    ReferenceKey,
};
use inverse_data::{Checkerboard, CleanSource};
use serde_json::Value;
use tempfile::tempdir;
use training::{Trainer, TrainingConfig};

struct CountingSource {
    inner: Checkerboard,
    calls: AtomicUsize,
}

impl CleanSource for CountingSource {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn feature_shape(&self) -> Vec<usize> {
        self.inner.feature_shape()
    }

    fn sample(&self, count: usize, device: &Device) -> inverse_data::Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.sample(count, device)
    }
}

fn small_config(results_dir: &Path) -> TrainingConfig {
    let mut config: TrainingConfig = toml::from_str(
        r#"
        [data]
        batch_size = 64
        validation_samples = 16

        [corruption]
        name = "gaussian_noise"
        levels = [0.2]

        [interpolant]
        n_steps = 4

        [model]
        time_embedding_dim = 4
        width = 16
        depth = 1

        [runtime]
        device = "cpu"
        train_steps = 4
        save_and_sample_every = 2

        [runtime.logging]
        enable_stdout = false
        "#,
    )
    .unwrap();
    config.experiment.results_dir = Some(results_dir.to_path_buf());
    config
}

#[test]
fn reference_statistics_are_cached() -> Result<()> {
    let dir = tempdir()?;
    let cache = ReferenceCache::new(dir.path());
    let key = ReferenceKey {
        dataset: "checker".to_string(),
        num_samples: 300,
        extractor: FlattenExtractor.name(),
        seed: 0,
    };
    let source = CountingSource {
        inner: Checkerboard::new(0),
        calls: AtomicUsize::new(0),
    };

    let first = cache.load_or_compute(&key, &source, &FlattenExtractor, 128, &Device::Cpu)?;
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert_eq!(first.count, 300);
    assert_eq!(first.dim, 2);
    assert!(cache.path_for(&key).is_file());

    let second = cache.load_or_compute(&key, &source, &FlattenExtractor, 128, &Device::Cpu)?;
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert_eq!(first.count, second.count);
    for (a, b) in first.covariance.iter().zip(&second.covariance) {
        assert!((a - b).abs() <= 1e-12 * a.abs().max(1.0));
    }

    let mut larger = key.clone();
    larger.num_samples = 400;
    cache.load_or_compute(&larger, &source, &FlattenExtractor, 128, &Device::Cpu)?;
    assert_eq!(source.calls.load(Ordering::SeqCst), 7);
    Ok(())
}

#[test]
fn trained_checkpoint_is_scored_and_recorded() -> Result<()> {
    let dir = tempdir()?;
    let config = small_config(dir.path());
    Trainer::new(config.clone())?.train()?;

    let settings = EvaluationSettings {
        model: "best".to_string(),
        num_samples: 2_000,
        batch_size: 500,
        ode_steps: Some(3),
        ..EvaluationSettings::default()
    };
    let evaluator = Evaluator::new(config, settings)?;
    let expected_path = dir.path().join("fid_2k_3steps_best.json");
    assert_eq!(evaluator.result_path(), expected_path);

    let report = evaluator.run()?;
    assert_eq!(report.output, expected_path);
    assert!(report.score.is_finite());
    assert!(report.score > -1e-6);
    assert_eq!(report.generated.count, 2_000);
    assert_eq!(report.reference.dim, 2);

    let value: Value = serde_json::from_str(&fs::read_to_string(&expected_path)?)?;
    let recorded = value["FID_best"].as_f64().unwrap();
    assert!((recorded - report.score).abs() <= 1e-12 * report.score.abs().max(1.0));
    Ok(())
}

#[test]
fn missing_checkpoints_are_reported() -> Result<()> {
    let dir = tempdir()?;
    let settings = EvaluationSettings {
        num_samples: 10,
        ..EvaluationSettings::default()
    };
    let evaluator = Evaluator::new(small_config(dir.path()), settings)?;
    assert!(evaluator.run().is_err());
    assert!(Evaluator::new(
        small_config(dir.path()),
        EvaluationSettings {
            batch_size: 0,
            ..EvaluationSettings::default()
        }
    )
    .is_err());
    Ok(())
}
