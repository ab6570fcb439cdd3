use std::{
    fs,
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use training::{
    checkpoint::{self, Milestone},
    context::select_device,
    pipeline, TrainingConfig,
};
use velocity::VelocityModel;

use crate::{
    features::{FeatureExtractor, FlattenExtractor},
    frechet::{frechet_distance, DEFAULT_EPS},
    reference::{batch_groups, ReferenceCache, ReferenceKey},
    statistics::{FeatureAccumulator, FeatureStatistics},
    EvaluationError, Result,
};

// Keeps evaluation draws apart from the streams used during training.
const EVALUATION_SEED_OFFSET: u64 = 7_919;
const REFERENCE_SEED_OFFSET: u64 = 5_003;

#[derive(Debug, Clone)]
pub struct EvaluationSettings {
    /// Checkpoint to score: `best`, `latest`, a step or a directory.
    pub model: String,
    pub num_samples: usize,
    pub batch_size: usize,
    /// Euler steps for transport; the configured count when unset.
    pub ode_steps: Option<usize>,
    /// Score the EMA shadow when the checkpoint has one.
    pub prefer_ema: bool,
    pub eps: f64,
    /// Result file; defaults to `fid_<n>k_<steps>steps_<model>.json` in the results directory.
    pub output: Option<PathBuf>,
}

impl Default for EvaluationSettings {
    fn default() -> Self {
        Self {
            model: "best".to_string(),
            num_samples: 50_000,
            batch_size: 128,
            ode_steps: None,
            prefer_ema: true,
            eps: DEFAULT_EPS,
            output: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub model: String,
    pub score: f64,
    pub output: PathBuf,
    pub generated: FeatureStatistics,
    pub reference: FeatureStatistics,
}

/// Scores a trained checkpoint by transporting fresh corrupted samples and
/// comparing their features against the clean reference population.
pub struct Evaluator<E: FeatureExtractor = FlattenExtractor> {
    config: TrainingConfig,
    settings: EvaluationSettings,
    extractor: E,
}

impl Evaluator<FlattenExtractor> {
    pub fn new(config: TrainingConfig, settings: EvaluationSettings) -> Result<Self> {
        Self::with_extractor(config, settings, FlattenExtractor)
    }
}

impl<E: FeatureExtractor> Evaluator<E> {
    pub fn with_extractor(
        mut config: TrainingConfig,
        settings: EvaluationSettings,
        extractor: E,
    ) -> Result<Self> {
        if settings.num_samples < 2 {
            return Err(EvaluationError::Settings(
                "num_samples must be at least 2".to_string(),
            ));
        }
        if settings.batch_size == 0 {
            return Err(EvaluationError::Settings(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if !(settings.eps.is_finite() && settings.eps > 0.0) {
            return Err(EvaluationError::Settings(
                "eps must be a positive number".to_string(),
            ));
        }
        if let Some(steps) = settings.ode_steps {
            config.interpolant.n_steps = steps;
        }
        config.validate()?;
        Ok(Self {
            config,
            settings,
            extractor,
        })
    }

    /// Label used in the result key and file name.
    pub fn model_label(&self) -> String {
        model_label(&self.settings.model)
    }

    pub fn result_path(&self) -> PathBuf {
        if let Some(path) = &self.settings.output {
            return path.clone();
        }
        self.config.results_dir().join(format!(
            "fid_{}k_{}steps_{}.json",
            self.settings.num_samples / 1000,
            self.config.interpolant.n_steps,
            self.model_label()
        ))
    }

    pub fn run(&self) -> Result<EvaluationReport> {
        let config = &self.config;
        let device = select_device(config.runtime.device, 0);
        let results_dir = config.results_dir();

        let source = pipeline::build_source(config, 0)?;
        let operator = pipeline::build_operator(config, EVALUATION_SEED_OFFSET)?;
        let interpolant = pipeline::build_interpolant(config, operator.clone(), 0)?;
        let model = pipeline::build_model(config, source.feature_dim(), &device)?;

        let directory = checkpoint::resolve_checkpoint(&results_dir, &self.settings.model)?;
        log::info!("loading model from {}", directory.display());
        checkpoint::load_inference_weights(
            &directory,
            &model.named_parameters(),
            &device,
            self.settings.prefer_ema,
        )?;

        let reference_source = inverse_data::build_source(
            &config.data.dataset,
            config.data.path.as_deref(),
            config.runtime.seed.wrapping_add(REFERENCE_SEED_OFFSET),
        )?;
        let key = ReferenceKey {
            dataset: reference_source.name(),
            num_samples: self.settings.num_samples,
            extractor: self.extractor.name(),
            seed: config.runtime.seed,
        };
        let reference = ReferenceCache::new(&results_dir).load_or_compute(
            &key,
            reference_source.as_ref(),
            &self.extractor,
            self.settings.batch_size,
            &device,
        )?;

        log::info!(
            "stacking features for {} generated samples ({} transport steps)",
            self.settings.num_samples,
            interpolant.n_steps()
        );
        let mut accumulator = FeatureAccumulator::default();
        for group in batch_groups(self.settings.num_samples, self.settings.batch_size) {
            let clean = source.sample(group, &device)?;
            let corruption = operator.apply(&clean)?;
            let latent = if interpolant.uses_latents() {
                corruption.latent.as_ref()
            } else {
                None
            };
            let cleaned = interpolant.transport(&model, &corruption.corrupted, latent)?;
            accumulator.push_features(&self.extractor.extract(&cleaned)?)?;
        }
        let generated = accumulator.finish()?;

        let score = frechet_distance(&generated, &reference, self.settings.eps)?;
        let label = self.model_label();
        log::info!("FID score of {label} model: {score}");

        let output = self.result_path();
        write_result(&output, &label, score)?;
        log::info!("wrote {}", output.display());

        Ok(EvaluationReport {
            model: label,
            score,
            output,
            generated,
            reference,
        })
    }
}

/// Writes `{"FID_<model>": score}` as pretty JSON.
pub fn write_result(path: &Path, model: &str, score: f64) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut record = Map::new();
    record.insert(format!("FID_{model}"), Value::from(score));
    let mut contents = serde_json::to_string_pretty(&Value::Object(record))?;
    contents.push('\n');
    fs::write(path, contents)?;
    Ok(())
}

fn model_label(identifier: &str) -> String {
    if let Ok(milestone) = identifier.parse::<Milestone>() {
        return milestone.to_string();
    }
    let name = Path::new(identifier)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| identifier.to_string());
    name.strip_prefix("model-").map(str::to_string).unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_come_from_milestones_or_directories() {
        assert_eq!(model_label("best"), "best");
        assert_eq!(model_label("5000"), "5000");
        assert_eq!(model_label("/runs/checker/model-latest"), "latest");
        assert_eq!(model_label("snapshots/final"), "final");
    }

    #[test]
    fn result_file_holds_a_single_named_score() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fid.json");
        write_result(&path, "best", 1.25).unwrap();
        let value: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert_eq!(object["FID_best"].as_f64(), Some(1.25));
    }
}
