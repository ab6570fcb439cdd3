use candle_core::DType;
use interpolant::InterpolantError;
use inverse_data::DataError;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub data: DataConfig,
    pub corruption: CorruptionConfig,
    #[serde(default)]
    pub interpolant: InterpolantConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub ema: EmaConfig,
    #[serde(default)]
    pub stability: StabilityConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if self.data.dataset.trim().is_empty() {
            errors.push("data.dataset must not be empty".to_string());
        }

        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }

        if self.data.gradient_accumulation_steps == 0 {
            errors.push("data.gradient_accumulation_steps must be greater than 0".to_string());
        } else if self.data.batch_size % self.data.gradient_accumulation_steps != 0 {
            errors.push(
                "data.batch_size must be divisible by data.gradient_accumulation_steps"
                    .to_string(),
            );
        }

        if self.data.num_workers > 0 && self.data.prefetch == 0 {
            errors.push("data.prefetch must be greater than 0 when workers are used".to_string());
        }

        if self.corruption.name.trim().is_empty() {
            errors.push("corruption.name must not be empty".to_string());
        }

        if self.corruption.levels.is_empty() {
            errors.push("corruption.levels must list at least one value".to_string());
        }

        if self.interpolant.n_steps == 0 {
            errors.push("interpolant.n_steps must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.interpolant.alpha) {
            errors.push("interpolant.alpha must be in [0, 1]".to_string());
        }

        if self.interpolant.resamples == 0 {
            errors.push("interpolant.resamples must be greater than 0".to_string());
        }

        match (self.interpolant.variant, self.interpolant.diffusion_coef) {
            (InterpolantVariant::Follmer, None) => {
                errors.push("interpolant.diffusion_coef is required for follmer".to_string())
            }
            (_, Some(eps)) if !(eps.is_finite() && eps >= 0.0) => {
                errors.push("interpolant.diffusion_coef must be finite and >= 0".to_string())
            }
            _ => {}
        }

        if self.model.time_embedding_dim < 2 || self.model.time_embedding_dim % 2 != 0 {
            errors.push("model.time_embedding_dim must be even and at least 2".to_string());
        }

        if self.model.width == 0 || self.model.depth == 0 {
            errors.push("model.width and model.depth must be greater than 0".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }

        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }

        if matches!(self.optimizer.algorithm, OptimizerType::Adam)
            && self.optimizer.weight_decay != 0.0
        {
            errors.push("optimizer.weight_decay requires algorithm = \"adam_w\"".to_string());
        }

        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }

        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if let Some(max_norm) = self.optimizer.max_grad_norm {
            if max_norm <= 0.0 {
                errors.push("optimizer.max_grad_norm must be greater than 0".to_string());
            }
        }

        if !(0.0..=1.0).contains(&self.scheduler.warmup_fraction) {
            errors.push("scheduler.warmup_fraction must be in [0, 1]".to_string());
        }

        if self.scheduler.min_lr < 0.0 {
            errors.push("scheduler.min_lr must be >= 0".to_string());
        }
        if self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
        }

        if !(0.0..1.0).contains(&self.ema.decay) {
            errors.push("ema.decay must be in [0, 1)".to_string());
        }

        if self.ema.update_every == 0 {
            errors.push("ema.update_every must be greater than 0".to_string());
        }

        if self.stability.window < 2 {
            errors.push("stability.window must be at least 2".to_string());
        }

        if !(self.stability.threshold.is_finite() && self.stability.threshold > 0.0) {
            errors.push("stability.threshold must be a positive number".to_string());
        }

        if self.runtime.train_steps == 0 {
            errors.push("runtime.train_steps must be greater than 0".to_string());
        }

        if self.runtime.save_and_sample_every == 0 {
            errors.push("runtime.save_and_sample_every must be greater than 0".to_string());
        }

        if self.runtime.milestone_every == 0 {
            errors.push("runtime.milestone_every must be greater than 0".to_string());
        }

        if self.runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.experiment.apply_base_path(base);
        if let Some(path) = self.data.path.as_mut() {
            absolutize_in_place(path, base);
        }
        if let Some(dir) = self.runtime.logging.tensorboard.as_mut() {
            absolutize_in_place(dir, base);
        }
    }

    /// Directory holding checkpoints, the losses log and sample grids. Derived from
    /// the dataset and corruption unless set explicitly.
    pub fn results_dir(&self) -> PathBuf {
        if let Some(dir) = &self.experiment.results_dir {
            return dir.clone();
        }
        let levels = self
            .corruption
            .levels
            .iter()
            .map(|level| format!("{level:0.2}"))
            .collect::<Vec<_>>()
            .join("-");
        let mut folder = format!("{}-{}-{}", self.data.dataset, self.corruption.name, levels);
        if !self.experiment.prefix.is_empty() {
            folder = format!("{}-{folder}", self.experiment.prefix);
        }
        if !self.experiment.suffix.is_empty() {
            folder = format!("{folder}-{}", self.experiment.suffix);
        }
        self.experiment.results_root.join(folder)
    }

    pub fn model_dtype(&self) -> DType {
        precision_to_dtype(self.runtime.precision)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_results_root")]
    pub results_root: PathBuf,
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            results_root: default_results_root(),
            results_dir: None,
            prefix: String::new(),
            suffix: String::new(),
        }
    }
}

impl ExperimentConfig {
    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.results_root, base);
        if let Some(dir) = self.results_dir.as_mut() {
            absolutize_in_place(dir, base);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_dataset")]
    pub dataset: String,
    /// Safetensors file for datasets that are not synthetic.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
    #[serde(default = "default_validation_samples")]
    pub validation_samples: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            dataset: default_dataset(),
            path: None,
            batch_size: default_batch_size(),
            gradient_accumulation_steps: default_gradient_accumulation_steps(),
            num_workers: 0,
            prefetch: default_prefetch(),
            validation_samples: default_validation_samples(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorruptionConfig {
    #[serde(default = "default_corruption")]
    pub name: String,
    #[serde(default)]
    pub levels: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpolantVariant {
    #[default]
    Deconvolving,
    Follmer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpolantConfig {
    #[serde(default)]
    pub variant: InterpolantVariant,
    #[serde(default = "default_ode_steps")]
    pub n_steps: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_resamples")]
    pub resamples: usize,
    /// Condition on operator latents. Defaults to whatever the operator exposes.
    #[serde(default)]
    pub use_latents: Option<bool>,
    #[serde(default)]
    pub diffusion_coef: Option<f64>,
}

impl Default for InterpolantConfig {
    fn default() -> Self {
        Self {
            variant: InterpolantVariant::default(),
            n_steps: default_ode_steps(),
            alpha: default_alpha(),
            resamples: default_resamples(),
            use_latents: None,
            diffusion_coef: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_time_embedding_dim")]
    pub time_embedding_dim: usize,
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_depth")]
    pub depth: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            time_embedding_dim: default_time_embedding_dim(),
            width: default_width(),
            depth: default_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub algorithm: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_max_grad_norm")]
    pub max_grad_norm: Option<f64>,
    /// Parameter-name fragments excluded from weight decay.
    #[serde(default)]
    pub weight_decay_exclude: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            max_grad_norm: default_max_grad_norm(),
            weight_decay_exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[default]
    Adam,
    AdamW,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: LearningRateSchedule,
    #[serde(default = "default_warmup_fraction")]
    pub warmup_fraction: f64,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default = "default_power")]
    pub power: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: LearningRateSchedule::default(),
            warmup_fraction: default_warmup_fraction(),
            min_lr: 0.0,
            power: default_power(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant,
    #[default]
    CosineWithWarmup,
    Polynomial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmaConfig {
    #[serde(default = "default_ema_decay")]
    pub decay: f64,
    #[serde(default = "default_ema_update_every")]
    pub update_every: usize,
}

impl Default for EmaConfig {
    fn default() -> Self {
        Self {
            decay: default_ema_decay(),
            update_every: default_ema_update_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityConfig {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub rollback_policy: RollbackPolicy,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            threshold: default_threshold(),
            rollback_policy: RollbackPolicy::default(),
        }
    }
}

/// What happens to the optimizer moments when a loss spike rolls training back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Reload the moments stored with the `best` checkpoint.
    #[default]
    Restore,
    /// Start the moments from zero.
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_train_steps")]
    pub train_steps: usize,
    /// Steps trained against known clean samples before the bootstrap loss takes over.
    #[serde(default)]
    pub clean_data_steps: usize,
    #[serde(default = "default_save_and_sample_every")]
    pub save_and_sample_every: usize,
    #[serde(default = "default_milestone_every")]
    pub milestone_every: usize,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            device: DevicePreference::default(),
            precision: Precision::default(),
            train_steps: default_train_steps(),
            clean_data_steps: 0,
            save_and_sample_every: default_save_and_sample_every(),
            milestone_every: default_milestone_every(),
            log_every_n_steps: default_log_every_n_steps(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard: Option<PathBuf>,
    #[serde(default = "default_tensorboard_flush")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard: None,
            tensorboard_flush_every_n: default_tensorboard_flush(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
    Mixed,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_results_root() -> PathBuf {
    PathBuf::from("results")
}

fn default_dataset() -> String {
    "checker".to_string()
}

fn default_corruption() -> String {
    "gaussian_noise".to_string()
}

fn default_batch_size() -> usize {
    4000
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_prefetch() -> usize {
    4
}

fn default_validation_samples() -> usize {
    2000
}

fn default_ode_steps() -> usize {
    40
}

fn default_alpha() -> f64 {
    1.0
}

fn default_resamples() -> usize {
    1
}

fn default_time_embedding_dim() -> usize {
    64
}

fn default_width() -> usize {
    256
}

fn default_depth() -> usize {
    3
}

fn default_learning_rate() -> f64 {
    5e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_max_grad_norm() -> Option<f64> {
    Some(1.0)
}

fn default_warmup_fraction() -> f64 {
    0.1
}

fn default_power() -> f64 {
    1.0
}

fn default_ema_decay() -> f64 {
    0.995
}

fn default_ema_update_every() -> usize {
    10
}

fn default_window() -> usize {
    11
}

fn default_threshold() -> f64 {
    10.0
}

fn default_seed() -> u64 {
    42
}

fn default_train_steps() -> usize {
    20_000
}

fn default_save_and_sample_every() -> usize {
    1000
}

fn default_milestone_every() -> usize {
    5000
}

fn default_log_every_n_steps() -> usize {
    100
}

fn default_true() -> bool {
    true
}

fn default_tensorboard_flush() -> usize {
    10
}

fn precision_to_dtype(precision: Precision) -> DType {
    match precision {
        Precision::Fp32 => DType::F32,
        Precision::Fp16 => DType::F16,
        Precision::Bf16 => DType::BF16,
        Precision::Mixed => DType::BF16,
    }
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
    Interpolant(InterpolantError),
    Data(DataError),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
            TrainingError::Interpolant(err) => write!(f, "interpolant error: {}", err),
            TrainingError::Data(err) => write!(f, "data error: {}", err),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::Interpolant(err) => Some(err),
            TrainingError::Data(err) => Some(err),
            TrainingError::ConfigFormat(_) | TrainingError::Validation(_) => None,
            TrainingError::Initialization(_) | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<InterpolantError> for TrainingError {
    fn from(value: InterpolantError) -> Self {
        TrainingError::Interpolant(value)
    }
}

impl From<DataError> for TrainingError {
    fn from(value: DataError) -> Self {
        TrainingError::Data(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> TrainingConfig {
        toml::from_str(
            r#"
            [corruption]
            name = "gaussian_noise"
            levels = [0.4]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_follow_the_reference_experiments() {
        let config = minimal();
        assert_eq!(config.data.dataset, "checker");
        assert_eq!(config.interpolant.n_steps, 40);
        assert_eq!(config.ema.decay, 0.995);
        assert_eq!(config.ema.update_every, 10);
        assert_eq!(config.stability.window, 11);
        assert_eq!(config.stability.threshold, 10.0);
        assert_eq!(config.stability.rollback_policy, RollbackPolicy::Restore);
        assert_eq!(config.runtime.milestone_every, 5000);
        assert_eq!(config.optimizer.max_grad_norm, Some(1.0));
        config.validate().unwrap();
    }

    #[test]
    fn results_dir_encodes_dataset_and_corruption() {
        let mut config = minimal();
        config.experiment.results_root = PathBuf::from("/tmp/runs");
        config.experiment.suffix = "mixed".to_string();
        assert_eq!(
            config.results_dir(),
            PathBuf::from("/tmp/runs/checker-gaussian_noise-0.40-mixed")
        );
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = minimal();
        config.data.batch_size = 10;
        config.data.gradient_accumulation_steps = 3;
        config.interpolant.alpha = 1.5;
        config.interpolant.variant = InterpolantVariant::Follmer;
        config.stability.window = 1;

        let Err(TrainingError::Validation(messages)) = config.validate() else {
            panic!("expected validation failure");
        };
        assert_eq!(messages.len(), 4, "{messages:?}");
    }

    #[test]
    fn loads_json_and_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(
            &path,
            r#"{"corruption": {"name": "mask", "levels": [0.3]},
                "data": {"dataset": "points", "path": "points.safetensors"}}"#,
        )
        .unwrap();

        let config = TrainingConfig::load(&path).unwrap();
        assert_eq!(config.data.path, Some(dir.path().join("points.safetensors")));
        assert!(config.experiment.results_root.starts_with(dir.path()));
    }
}
