use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use candle_core::{backprop::GradStore, DType, Device, Tensor};
use interpolant::{ForwardOperator, Interpolant};
use inverse_data::CleanSource;
use velocity::{FeedForwardVelocity, VelocityModel};

use crate::{
    checkpoint::{self, CheckpointDescriptor, EmaSnapshot, Milestone, SaveRequest},
    config::RollbackPolicy,
    context::{GradientReducer, LocalReducer, WorkerContext},
    data::{BlockingDataLoader, CorruptionDataLoader},
    ema::EmaModel,
    guard::{GuardVerdict, RollbackReason, StabilityGuard},
    logging::{Logger, LoggingSettings},
    metrics::TrainingMetrics,
    optimizer::{
        scaler::contains_non_finite, AdamConfig, GradientScaler, TrainerOptimizer,
        TrainerOptimizerOptions,
    },
    pipeline::{self, Components},
    scheduler::{LRScheduler, SchedulerConfig, SchedulerState},
    TrainingConfig, TrainingError,
};

const LOSSES_FILENAME: &str = "losses.npy";

/// Result of one training iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Committed { step: usize, loss: f64 },
    RolledBack(RollbackReason),
}

/// Fixed batch used for every qualitative sample grid of a run.
struct ValidationBatch {
    clean: Tensor,
    corrupted: Tensor,
    latent: Option<Tensor>,
}

impl ValidationBatch {
    fn draw(
        source: &dyn CleanSource,
        operator: &dyn ForwardOperator,
        count: usize,
        device: &Device,
    ) -> Result<Self, TrainingError> {
        let clean = source.sample(count.max(1), &Device::Cpu)?;
        let corruption = operator.apply(&clean)?;
        let to_device = |tensor: Tensor| tensor.to_device(device).map_err(to_runtime_error);
        Ok(Self {
            clean: to_device(clean)?,
            corrupted: to_device(corruption.corrupted)?,
            latent: corruption.latent.map(to_device).transpose()?,
        })
    }
}

pub struct Trainer<M: VelocityModel> {
    config: TrainingConfig,
    context: WorkerContext,
    results_dir: PathBuf,
    model: M,
    ema: Option<EmaModel<M>>,
    interpolant: Arc<dyn Interpolant>,
    data_loader: BlockingDataLoader<CorruptionDataLoader>,
    validation: ValidationBatch,
    optimizer: TrainerOptimizer,
    scheduler: Option<Box<dyn LRScheduler>>,
    gradient_scaler: GradientScaler,
    reducer: Box<dyn GradientReducer>,
    guard: StabilityGuard,
    parameter_tensors: Vec<Tensor>,
    step: usize,
    losses: Vec<f64>,
    best_loss: Option<f64>,
    metrics: TrainingMetrics,
    logger: Logger,
}

impl Trainer<FeedForwardVelocity> {
    /// Builds a feed-forward run from configuration, reading the worker identity
    /// from the environment.
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;
        let context = WorkerContext::from_env(config.runtime.device, config.runtime.seed)?;
        let components = pipeline::default_components(&config, context.rank, &context.device)?;
        Self::from_components(config, context, components)
    }
}

impl<M: VelocityModel> Trainer<M> {
    pub fn from_components(
        config: TrainingConfig,
        context: WorkerContext,
        components: Components<M>,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        let Components {
            model,
            interpolant,
            operator,
            source,
        } = components;

        let results_dir = config.results_dir();
        if context.is_primary() {
            fs::create_dir_all(&results_dir).map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to create results directory {}: {err}",
                    results_dir.display()
                ))
            })?;
        }

        let validation = ValidationBatch::draw(
            source.as_ref(),
            operator.as_ref(),
            config.data.validation_samples,
            &context.device,
        )?;

        let data_loader = BlockingDataLoader::new(CorruptionDataLoader::new(
            source,
            operator,
            context.device.clone(),
            config.data.batch_size,
            config.data.gradient_accumulation_steps,
            config.data.num_workers,
            config.data.prefetch,
        )?);

        let named_parameters = model.named_parameters();
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        let parameter_tensors: Vec<Tensor> = named_parameters
            .iter()
            .map(|(_, var)| var.as_tensor().clone())
            .collect();

        let optimizer = TrainerOptimizer::new(
            named_parameters,
            AdamConfig::from(&config.optimizer),
            TrainerOptimizerOptions::from(&config.optimizer),
        )?;

        let scheduler = if config.scheduler.enabled {
            Some(
                SchedulerConfig::from_training_config(
                    &config.scheduler,
                    optimizer.learning_rate(),
                    config.runtime.train_steps,
                )?
                .build(),
            )
        } else {
            None
        };

        let ema = if context.is_primary() {
            Some(EmaModel::new(
                &model,
                config.ema.decay,
                config.ema.update_every,
            )?)
        } else {
            None
        };

        if context.world_size > 1 {
            log::warn!(
                "world size is {} but no cross-process reducer is installed; \
                 gradients and step losses are not averaged across workers",
                context.world_size
            );
        }

        let logger = if context.is_primary() {
            Logger::new(LoggingSettings::from(&config.runtime.logging))?
        } else {
            Logger::disabled()
        };

        log::info!(
            "trainer ready: {} parameters, {} interpolant ({} steps), results in {}",
            model.parameter_count(),
            interpolant.name(),
            interpolant.n_steps(),
            results_dir.display()
        );

        let guard = StabilityGuard::new(config.stability.window, config.stability.threshold);
        let gradient_scaler = GradientScaler::new(config.runtime.precision);

        Ok(Self {
            config,
            context,
            results_dir,
            model,
            ema,
            interpolant,
            data_loader,
            validation,
            optimizer,
            scheduler,
            gradient_scaler,
            reducer: Box::new(LocalReducer),
            guard,
            parameter_tensors,
            step: 0,
            losses: Vec::new(),
            best_loss: None,
            metrics: TrainingMetrics::new(),
            logger,
        })
    }

    pub fn with_reducer(mut self, reducer: Box<dyn GradientReducer>) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn step(&self) -> usize {
        self.step
    }

    /// Total loss of every iteration so far, rolled-back ones included.
    pub fn losses(&self) -> &[f64] {
        &self.losses
    }

    pub fn rollbacks(&self) -> usize {
        self.metrics.rollbacks()
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn ema(&self) -> Option<&EmaModel<M>> {
        self.ema.as_ref()
    }

    pub fn guard(&self) -> &StabilityGuard {
        &self.guard
    }

    pub fn optimizer(&self) -> &TrainerOptimizer {
        &self.optimizer
    }

    pub fn train(&mut self) -> Result<(), TrainingError> {
        self.train_with_shutdown(|| false)
    }

    pub fn train_with_shutdown<F>(&mut self, mut should_stop: F) -> Result<(), TrainingError>
    where
        F: FnMut() -> bool,
    {
        log::info!(
            "starting training at step {} of {} on {:?}",
            self.step,
            self.config.runtime.train_steps,
            self.context.device
        );
        while self.step < self.config.runtime.train_steps {
            if should_stop() {
                log::info!("stop requested at step {}", self.step);
                break;
            }
            self.train_step()?;
        }
        self.finish()
    }

    /// Runs one iteration: accumulate, reduce, update, then let the stability
    /// guard decide between commit and rollback.
    pub fn train_step(&mut self) -> Result<StepOutcome, TrainingError> {
        let use_clean = self.step < self.config.runtime.clean_data_steps;
        let mut accumulated: Option<GradStore> = None;
        let mut total_loss = 0.0f64;
        let mut examples = 0usize;

        loop {
            let batch = self
                .data_loader
                .next_batch()?
                .ok_or_else(|| TrainingError::runtime("data loader stopped producing batches"))?;
            let accumulation = batch.micro_batches_per_step.max(1) as f64;

            let output = if use_clean {
                self.interpolant.clean_loss(&self.model, &batch.clean)?
            } else {
                self.interpolant
                    .loss(&self.model, &batch.corrupted, batch.latent.as_ref())?
            };
            total_loss += output.value / accumulation;
            examples += batch.micro_batch_size;

            let normalized = output
                .loss
                .affine(1.0 / accumulation, 0.0)
                .map_err(to_runtime_error)?;
            let scaled = self.gradient_scaler.scale(&normalized)?;
            let micro_grads = scaled.backward().map_err(to_runtime_error)?;
            match accumulated.as_mut() {
                Some(existing) => self.merge_gradient_store(existing, micro_grads)?,
                None => accumulated = Some(micro_grads),
            }

            if batch.micro_batch_index + 1 >= batch.micro_batches_per_step {
                break;
            }
        }

        let mut grads =
            accumulated.ok_or_else(|| TrainingError::runtime("no gradients were produced"))?;

        self.reducer.all_reduce(&mut grads, &self.parameter_tensors)?;
        let total_loss = self.reducer.reduce_loss(total_loss)?;
        self.losses.push(total_loss);
        self.synchronize()?;

        let (mut found_inf, grad_norm) = self.unscale_gradients(&mut grads)?;
        if !total_loss.is_finite() {
            found_inf = true;
        }
        self.gradient_scaler.update(found_inf);

        let lr = if found_inf {
            log::warn!(
                "non-finite gradients at step {}; skipping parameter update",
                self.step
            );
            self.optimizer.zero_grad(&mut grads);
            self.optimizer.learning_rate()
        } else {
            let lr = match self.scheduler.as_mut() {
                Some(scheduler) => {
                    let lr = scheduler.step();
                    self.optimizer.set_learning_rate(lr);
                    lr
                }
                None => self.optimizer.learning_rate(),
            };
            self.optimizer.step(&mut grads)?;
            lr
        };
        self.synchronize()?;

        match self.guard.observe(total_loss) {
            GuardVerdict::Rollback(reason) => {
                self.rollback(&reason)?;
                Ok(StepOutcome::RolledBack(reason))
            }
            GuardVerdict::Commit => {
                self.commit(total_loss, grad_norm, lr, examples)?;
                Ok(StepOutcome::Committed {
                    step: self.step,
                    loss: total_loss,
                })
            }
        }
    }

    /// Restores trainer state from a checkpoint directory or a milestone name
    /// (`best`, `latest`, a step) under the results directory.
    pub fn resume(&mut self, identifier: &str) -> Result<CheckpointDescriptor, TrainingError> {
        let directory = checkpoint::resolve_checkpoint(&self.results_dir, identifier)?;
        log::info!("loading checkpoint from {}", directory.display());
        let outcome = checkpoint::load_checkpoint(&directory)?;

        checkpoint::apply_weights(
            &self.model.named_parameters(),
            &outcome.model_weights_path,
            &self.context.device,
        )?;

        match outcome.optimizer_state {
            Some(state) => self.optimizer.load_state(state)?,
            None => {
                log::warn!("checkpoint has no optimizer state; moments start from zero");
                self.optimizer.reset_state()?;
            }
        }
        self.restore_scheduler(outcome.scheduler_state)?;
        match outcome.scaler_state {
            Some(state) => self.gradient_scaler.load_state(state),
            None => log::warn!("checkpoint has no loss-scale state"),
        }

        if let Some(ema) = self.ema.as_mut() {
            match &outcome.ema_weights_path {
                Some(path) => {
                    checkpoint::apply_weights(&ema.named_parameters(), path, &self.context.device)?
                }
                None => {
                    log::warn!("checkpoint has no ema weights; shadow restarts from the model");
                    checkpoint::apply_weights(
                        &ema.named_parameters(),
                        &outcome.model_weights_path,
                        &self.context.device,
                    )?;
                }
            }
            match outcome.ema_state {
                Some(state) => ema.load_state(state),
                None => log::warn!("checkpoint has no ema counters"),
            }
        }

        self.step = outcome.manifest.step;
        self.guard.clear();
        self.reload_losses()?;
        self.best_loss = self.recorded_best_loss();
        log::info!(
            "resumed at step {} ({} logged losses, best loss {:?})",
            self.step,
            self.losses.len(),
            self.best_loss
        );

        Ok(CheckpointDescriptor {
            directory,
            manifest: outcome.manifest,
        })
    }

    /// Writes a checkpoint for `milestone` tagged with the most recent loss.
    pub fn save(&self, milestone: Milestone) -> Result<CheckpointDescriptor, TrainingError> {
        checkpoint::save_checkpoint(SaveRequest {
            results_dir: &self.results_dir,
            milestone,
            config: &self.config,
            parameters: self.model.named_parameters(),
            ema: self.ema.as_ref().map(|ema| EmaSnapshot {
                parameters: ema.named_parameters(),
                state: ema.state(),
            }),
            optimizer: &self.optimizer,
            scheduler: self.scheduler.as_deref(),
            scaler: &self.gradient_scaler,
            step: self.step,
            loss: self.losses.last().copied(),
        })
    }

    /// Transports the fixed validation batch and stores clean, corrupted and
    /// reconstructed tensors side by side.
    pub fn write_samples(&self, label: &str) -> Result<PathBuf, TrainingError> {
        let batch = &self.validation;
        let reconstructed = match &self.ema {
            Some(ema) => {
                self.interpolant
                    .transport(ema.model(), &batch.corrupted, batch.latent.as_ref())?
            }
            None => self
                .interpolant
                .transport(&self.model, &batch.corrupted, batch.latent.as_ref())?,
        };

        let mut tensors = HashMap::new();
        for (name, tensor) in [
            ("clean", &batch.clean),
            ("corrupted", &batch.corrupted),
            ("reconstructed", &reconstructed),
        ] {
            let cpu = tensor.to_device(&Device::Cpu).map_err(to_runtime_error)?;
            tensors.insert(name.to_string(), cpu);
        }
        let path = self.results_dir.join(format!("samples-{label}.safetensors"));
        candle_core::safetensors::save(&tensors, &path).map_err(|err| {
            TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
        })?;
        Ok(path)
    }

    fn commit(
        &mut self,
        loss: f64,
        grad_norm: f64,
        lr: f64,
        examples: usize,
    ) -> Result<(), TrainingError> {
        self.step += 1;
        if let Some(ema) = self.ema.as_mut() {
            ema.update(&self.model)?;
        }

        let snapshot = self.metrics.record_step(examples as u64, loss, grad_norm);
        let log_every = self.config.runtime.log_every_n_steps.max(1);
        if self.step == 1 || self.step % log_every == 0 {
            self.logger.log_training_step(
                self.step,
                self.config.runtime.train_steps,
                lr,
                self.gradient_scaler.loss_scale(),
                &snapshot,
            );
        }

        if !self.context.is_primary() {
            return Ok(());
        }

        if self.step % self.config.runtime.milestone_every == 0 {
            self.save(Milestone::Step(self.step))?;
        }

        let save_every = self.config.runtime.save_and_sample_every;
        if self.step % save_every == 0 {
            self.save(Milestone::Latest)?;
            if self.best_loss.map_or(true, |best| loss < best) {
                self.best_loss = Some(loss);
                self.save(Milestone::Best)?;
                self.logger.log_best(self.step, loss);
            }
            self.write_losses()?;
            let label = (self.step / save_every).to_string();
            if let Err(err) = self.write_samples(&label) {
                log::warn!("failed to write sample grid {label}: {err}");
            }
            self.logger.flush();
        }
        Ok(())
    }

    fn rollback(&mut self, reason: &RollbackReason) -> Result<(), TrainingError> {
        self.metrics.record_rollback();
        self.logger
            .log_rollback(self.step, reason, self.metrics.rollbacks());

        let Some(directory) = checkpoint::locate_checkpoint(&self.results_dir, Milestone::Best)
        else {
            log::warn!("no best checkpoint exists yet; keeping the current weights");
            return Ok(());
        };
        let outcome = checkpoint::load_checkpoint(&directory)?;
        checkpoint::apply_weights(
            &self.model.named_parameters(),
            &outcome.model_weights_path,
            &self.context.device,
        )?;

        match (self.config.stability.rollback_policy, outcome.optimizer_state) {
            (RollbackPolicy::Restore, Some(state)) => self.optimizer.load_state(state)?,
            (RollbackPolicy::Restore, None) => {
                log::warn!("best checkpoint has no optimizer state; resetting moments");
                self.optimizer.reset_state()?;
            }
            (RollbackPolicy::Reset, _) => self.optimizer.reset_state()?,
        }
        self.restore_scheduler(outcome.scheduler_state)?;
        if let Some(state) = outcome.scaler_state {
            self.gradient_scaler.load_state(state);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), TrainingError> {
        if self.context.is_primary() {
            self.save(Milestone::Latest)?;
            self.write_losses()?;
            if let Err(err) = self.write_samples("final") {
                log::warn!("failed to write final sample grid: {err}");
            }
            log::info!(
                "training complete at step {} ({} rollbacks)",
                self.step,
                self.metrics.rollbacks()
            );
        }
        self.logger.flush();
        Ok(())
    }

    fn restore_scheduler(&mut self, state: Option<SchedulerState>) -> Result<(), TrainingError> {
        match (self.scheduler.as_mut(), state) {
            (Some(scheduler), Some(state)) => {
                scheduler.load_snapshot(&state)?;
                self.optimizer.set_learning_rate(scheduler.learning_rate());
            }
            (Some(_), None) => {
                log::warn!("checkpoint has no scheduler state; the schedule restarts")
            }
            (None, Some(_)) => {
                log::warn!("checkpoint has scheduler state but scheduling is disabled")
            }
            (None, None) => {}
        }
        Ok(())
    }

    fn write_losses(&self) -> Result<(), TrainingError> {
        let path = self.results_dir.join(LOSSES_FILENAME);
        Tensor::new(self.losses.as_slice(), &Device::Cpu)
            .and_then(|losses| losses.write_npy(&path))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
            })
    }

    fn reload_losses(&mut self) -> Result<(), TrainingError> {
        let path = self.results_dir.join(LOSSES_FILENAME);
        if !path.is_file() {
            self.losses.clear();
            return Ok(());
        }
        self.losses = Tensor::read_npy(&path)
            .and_then(|losses| losses.to_dtype(DType::F64))
            .and_then(|losses| losses.to_vec1::<f64>())
            .map_err(|err| {
                TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
            })?;
        Ok(())
    }

    fn recorded_best_loss(&self) -> Option<f64> {
        let directory = self.results_dir.join(Milestone::Best.directory_name());
        checkpoint::read_manifest(&directory)
            .ok()
            .and_then(|manifest| manifest.loss)
    }

    fn synchronize(&self) -> Result<(), TrainingError> {
        self.context.device.synchronize().map_err(to_runtime_error)
    }

    fn merge_gradient_store(
        &self,
        accum: &mut GradStore,
        mut new_grads: GradStore,
    ) -> Result<(), TrainingError> {
        for tensor in &self.parameter_tensors {
            if let Some(grad) = new_grads.remove(tensor) {
                let combined = match accum.remove(tensor) {
                    Some(existing) => existing.add(&grad).map_err(to_runtime_error)?,
                    None => grad,
                };
                accum.insert(tensor, combined);
            }
        }
        Ok(())
    }

    fn unscale_gradients(&self, grads: &mut GradStore) -> Result<(bool, f64), TrainingError> {
        let mut found_inf = false;
        let mut sum_squares = 0.0f64;
        for tensor in &self.parameter_tensors {
            if let Some(grad) = grads.remove(tensor) {
                let unscaled = self.gradient_scaler.unscale(&grad)?;
                if !found_inf && contains_non_finite(&unscaled)? {
                    found_inf = true;
                }
                let sq = unscaled
                    .to_dtype(DType::F32)
                    .and_then(|t| t.sqr())
                    .and_then(|t| t.sum_all())
                    .and_then(|t| t.to_vec0::<f32>())
                    .map_err(to_runtime_error)? as f64;
                sum_squares += sq;
                grads.insert(tensor, unscaled);
            }
        }
        Ok((found_inf, sum_squares.max(0.0).sqrt()))
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
