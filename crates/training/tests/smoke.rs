use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use anyhow::Result;
use candle_core::{backprop::GradStore, Device, Tensor};
use interpolant::{Corruption, ForwardOperator};
use inverse_data::GaussianNoise;
use tempfile::tempdir;
use training::{
    checkpoint, pipeline, Components, GradientReducer, LoadOutcome, RollbackPolicy,
    RollbackReason, StepOutcome, Trainer, TrainingConfig, TrainingError, WorkerContext,
};
use velocity::{FeedForwardVelocity, VelocityModel};

fn small_config(results_dir: &Path) -> TrainingConfig {
    let mut config: TrainingConfig = toml::from_str(
        r#"
        [data]
        dataset = "checker"
        batch_size = 64
        validation_samples = 32

        [corruption]
        name = "gaussian_noise"
        levels = [0.1]

        [interpolant]
        n_steps = 4

        [model]
        time_embedding_dim = 4
        width = 16
        depth = 2

        [optimizer]
        learning_rate = 1e-3

        [runtime]
        seed = 3
        device = "cpu"
        train_steps = 6
        save_and_sample_every = 2
        milestone_every = 4
        log_every_n_steps = 1

        [runtime.logging]
        enable_stdout = false
        "#,
    )
    .unwrap();
    config.experiment.results_dir = Some(results_dir.to_path_buf());
    config
}

/// Gaussian noise that scales its output by `factor` on one chosen call.
struct SpikingOperator {
    inner: GaussianNoise,
    calls: AtomicUsize,
    spike_on_call: usize,
    factor: f64,
}

impl ForwardOperator for SpikingOperator {
    fn name(&self) -> &str {
        "spiking_noise"
    }

    fn apply(&self, clean: &Tensor) -> interpolant::Result<Corruption> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let corruption = self.inner.apply(clean)?;
        if call == self.spike_on_call {
            let corrupted = corruption.corrupted.affine(self.factor, 0.0)?;
            return Ok(Corruption::new(corrupted, corruption.latent));
        }
        Ok(corruption)
    }
}

#[test]
fn training_writes_checkpoints_and_resumes() -> Result<()> {
    let dir = tempdir()?;
    let config = small_config(dir.path());

    let mut trainer = Trainer::new(config.clone())?;
    trainer.train()?;
    assert_eq!(trainer.step(), 6);
    assert_eq!(trainer.losses().len(), 6);
    assert!(trainer.best_loss().is_some());

    for name in [
        "model-latest",
        "model-best",
        "model-4",
        "losses.npy",
        "samples-1.safetensors",
        "samples-3.safetensors",
        "samples-final.safetensors",
    ] {
        assert!(dir.path().join(name).exists(), "missing {name}");
    }

    let samples = candle_core::safetensors::load(
        dir.path().join("samples-final.safetensors"),
        &Device::Cpu,
    )?;
    assert_eq!(samples["reconstructed"].dims(), &[32, 2]);
    assert_eq!(samples["clean"].dims(), samples["corrupted"].dims());

    let mut resumed = Trainer::new(config)?;
    let descriptor = resumed.resume("latest")?;
    assert_eq!(descriptor.manifest.step, 6);
    assert_eq!(resumed.step(), 6);
    assert_eq!(resumed.losses(), trainer.losses());
    let (resumed_best, best) = (resumed.best_loss().unwrap(), trainer.best_loss().unwrap());
    assert!((resumed_best - best).abs() <= 1e-12 * best.abs().max(1.0));
    Ok(())
}

#[test]
fn accumulated_steps_with_a_worker_thread() -> Result<()> {
    let dir = tempdir()?;
    let mut config = small_config(dir.path());
    config.data.gradient_accumulation_steps = 2;
    config.data.num_workers = 1;
    config.data.prefetch = 2;
    config.runtime.train_steps = 3;
    config.runtime.clean_data_steps = 1;

    let mut trainer = Trainer::new(config)?;
    trainer.train()?;
    assert_eq!(trainer.step(), 3);
    assert!(trainer.losses().iter().all(|loss| loss.is_finite()));
    assert!(dir.path().join("model-latest").exists());
    Ok(())
}

fn spike_config(results_dir: &Path) -> TrainingConfig {
    let mut config = small_config(results_dir);
    config.runtime.train_steps = 10;
    config.stability.window = 3;
    config.stability.threshold = 100.0;
    config
}

fn trainer_with_operator(
    config: TrainingConfig,
    training_operator: Arc<dyn ForwardOperator>,
) -> Result<Trainer<FeedForwardVelocity>> {
    let source = pipeline::build_source(&config, 0)?;
    let operator = pipeline::build_operator(&config, 0)?;
    let interpolant = pipeline::build_interpolant(&config, training_operator, 0)?;
    let model = pipeline::build_model(&config, source.feature_dim(), &Device::Cpu)?;
    let components = Components {
        model,
        interpolant,
        operator,
        source,
    };
    Ok(Trainer::from_components(
        config,
        WorkerContext::single(Device::Cpu),
        components,
    )?)
}

fn spiking_trainer(config: TrainingConfig) -> Result<Trainer<FeedForwardVelocity>> {
    trainer_with_operator(
        config,
        Arc::new(SpikingOperator {
            inner: GaussianNoise::new(0.1, 11),
            calls: AtomicUsize::new(0),
            spike_on_call: 7,
            factor: 1e4,
        }),
    )
}

fn commit_six_steps(trainer: &mut Trainer<FeedForwardVelocity>) -> Result<()> {
    for expected in 1..=6 {
        match trainer.train_step()? {
            StepOutcome::Committed { step, .. } => assert_eq!(step, expected),
            other => panic!("unexpected outcome at step {expected}: {other:?}"),
        }
    }
    Ok(())
}

fn flat_values(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.flatten_all()?.to_vec1::<f32>()?)
}

/// Asserts the live parameters equal the weights stored in `model-best`.
fn assert_weights_match_best(
    trainer: &Trainer<FeedForwardVelocity>,
    outcome: &LoadOutcome,
) -> Result<()> {
    let reference = pipeline::build_model(trainer.config(), 2, &Device::Cpu)?;
    checkpoint::apply_weights(
        &reference.named_parameters(),
        &outcome.model_weights_path,
        &Device::Cpu,
    )?;
    let live = trainer.model().named_parameters();
    let stored = reference.named_parameters();
    assert_eq!(live.len(), stored.len());
    for ((name, var), (stored_name, stored_var)) in live.iter().zip(&stored) {
        assert_eq!(name, stored_name);
        assert_eq!(
            flat_values(var.as_tensor())?,
            flat_values(stored_var.as_tensor())?,
            "parameter {name} differs from the best checkpoint"
        );
    }
    Ok(())
}

#[test]
fn loss_spike_rolls_back_to_the_best_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let mut trainer = spiking_trainer(spike_config(dir.path()))?;

    commit_six_steps(&mut trainer)?;
    let best_dir = dir.path().join("model-best");
    assert!(best_dir.exists());

    match trainer.train_step()? {
        StepOutcome::RolledBack(RollbackReason::Spike { loss, window_mean }) => {
            assert!(loss > 100.0 * window_mean);
        }
        other => panic!("expected a rollback, got {other:?}"),
    }
    assert_eq!(trainer.step(), 6);
    assert!(trainer.guard().is_empty());
    assert_eq!(trainer.rollbacks(), 1);
    assert_eq!(trainer.losses().len(), 7);

    let outcome = checkpoint::load_checkpoint(&best_dir)?;
    assert_weights_match_best(&trainer, &outcome)?;
    let saved = outcome.optimizer_state.clone().expect("best keeps optimizer state");
    let live = trainer.optimizer().state()?;
    assert!(saved.step > 0);
    assert_eq!(live.step, saved.step);
    assert_eq!(trainer.optimizer().steps_taken(), saved.step);
    for (live, saved) in live.parameters.iter().zip(&saved.parameters) {
        assert_eq!(live.name, saved.name);
        assert_eq!(live.first_moment, saved.first_moment);
        assert_eq!(live.second_moment, saved.second_moment);
    }

    trainer.train()?;
    assert_eq!(trainer.step(), 10);
    assert_eq!(trainer.rollbacks(), 1);
    assert_eq!(trainer.losses().len(), 11);
    Ok(())
}

#[test]
fn reset_policy_restores_weights_with_fresh_moments() -> Result<()> {
    let dir = tempdir()?;
    let mut config = spike_config(dir.path());
    config.stability.rollback_policy = RollbackPolicy::Reset;
    let mut trainer = spiking_trainer(config)?;

    commit_six_steps(&mut trainer)?;
    assert!(matches!(
        trainer.train_step()?,
        StepOutcome::RolledBack(RollbackReason::Spike { .. })
    ));
    assert_eq!(trainer.step(), 6);

    let outcome = checkpoint::load_checkpoint(&dir.path().join("model-best"))?;
    assert_weights_match_best(&trainer, &outcome)?;
    let saved = outcome.optimizer_state.clone().expect("best keeps optimizer state");
    assert!(saved
        .parameters
        .iter()
        .any(|param| param.first_moment.iter().any(|value| *value != 0.0)));

    let live = trainer.optimizer().state()?;
    assert_eq!(live.step, 0);
    for param in &live.parameters {
        assert!(param.first_moment.iter().all(|value| *value == 0.0), "{}", param.name);
        assert!(param.second_moment.iter().all(|value| *value == 0.0), "{}", param.name);
    }
    Ok(())
}

/// Stands in for a peer whose loss explodes on one iteration.
struct PeerSpikeReducer {
    calls: AtomicUsize,
    spike_on_call: usize,
}

impl GradientReducer for PeerSpikeReducer {
    fn all_reduce(
        &self,
        _grads: &mut GradStore,
        _parameters: &[Tensor],
    ) -> Result<(), TrainingError> {
        Ok(())
    }

    fn reduce_loss(&self, loss: f64) -> Result<f64, TrainingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(if call == self.spike_on_call {
            loss * 1e4
        } else {
            loss
        })
    }
}

#[test]
fn guard_acts_on_the_reduced_loss() -> Result<()> {
    let dir = tempdir()?;
    let config = spike_config(dir.path());
    let operator = pipeline::build_operator(&config, 1)?;
    let mut trainer = trainer_with_operator(config, operator)?.with_reducer(Box::new(
        PeerSpikeReducer {
            calls: AtomicUsize::new(0),
            spike_on_call: 7,
        },
    ));

    commit_six_steps(&mut trainer)?;
    let local_mean = trainer.losses().iter().sum::<f64>() / 6.0;
    match trainer.train_step()? {
        StepOutcome::RolledBack(RollbackReason::Spike { loss, .. }) => {
            assert!(loss > 100.0 * local_mean);
            assert_eq!(trainer.losses().last().copied(), Some(loss));
        }
        other => panic!("expected a rollback, got {other:?}"),
    }
    assert_eq!(trainer.step(), 6);
    Ok(())
}
