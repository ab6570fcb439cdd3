//! Checkpoints live in `<results_dir>/model-<milestone>/`, where a milestone is
//! `best`, `latest` or a step number. Each directory holds the model weights, the
//! optional EMA shadow, optimizer/scheduler/scaler state and a manifest with
//! SHA-256 records for every file. Directories are staged under a temporary name
//! and renamed into place so a crash never leaves a half-written `model-best`.
//! The directory being replaced is first moved to `.model-<milestone>.previous`
//! and only deleted once the new one is in place; a run interrupted between the
//! two renames still resolves the milestone to the previous copy.

use std::{
    collections::HashMap,
    fmt,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device, Tensor, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    ema::EmaState,
    optimizer::{GradientScaler, GradientScalerState, OptimizerState, TrainerOptimizer},
    scheduler::{LRScheduler, SchedulerState},
    TrainingConfig, TrainingError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const EMA_FILENAME: &str = "ema.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const EMA_STATE_FILENAME: &str = "ema.json";
const MANIFEST_FILENAME: &str = "manifest.json";

/// Wrapper prefixes added by compiled or data-parallel models.
const WRAPPER_PREFIXES: [&str; 2] = ["_orig_mod.", "module."];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Milestone {
    Best,
    Latest,
    Step(usize),
}

impl Milestone {
    pub fn directory_name(&self) -> String {
        format!("model-{self}")
    }
}

impl fmt::Display for Milestone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Milestone::Best => f.write_str("best"),
            Milestone::Latest => f.write_str("latest"),
            Milestone::Step(step) => write!(f, "{step}"),
        }
    }
}

impl FromStr for Milestone {
    type Err = TrainingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "best" => Ok(Milestone::Best),
            "latest" => Ok(Milestone::Latest),
            other => other.parse::<usize>().map(Milestone::Step).map_err(|_| {
                TrainingError::runtime(format!(
                    "checkpoint milestone must be 'best', 'latest' or a step (got '{other}')"
                ))
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub config_sha256: String,
    pub milestone: String,
    pub step: usize,
    /// Loss of the step that produced the checkpoint.
    #[serde(default)]
    pub loss: Option<f64>,
    pub model: FileRecord,
    #[serde(default)]
    pub ema: Option<FileRecord>,
    #[serde(default)]
    pub ema_state: Option<FileRecord>,
    pub optimizer: FileRecord,
    #[serde(default)]
    pub scheduler: Option<FileRecord>,
    pub scaler: FileRecord,
}

pub struct EmaSnapshot {
    pub parameters: Vec<(String, Var)>,
    pub state: EmaState,
}

pub struct SaveRequest<'a> {
    pub results_dir: &'a Path,
    pub milestone: Milestone,
    pub config: &'a TrainingConfig,
    pub parameters: Vec<(String, Var)>,
    pub ema: Option<EmaSnapshot>,
    pub optimizer: &'a TrainerOptimizer,
    pub scheduler: Option<&'a dyn LRScheduler>,
    pub scaler: &'a GradientScaler,
    pub step: usize,
    pub loss: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

/// Everything read back from a checkpoint directory except the weights
/// themselves, which are bound to a model through [`apply_weights`].
pub struct LoadOutcome {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
    pub model_weights_path: PathBuf,
    pub ema_weights_path: Option<PathBuf>,
    pub ema_state: Option<EmaState>,
    pub optimizer_state: Option<OptimizerState>,
    pub scheduler_state: Option<SchedulerState>,
    pub scaler_state: Option<GradientScalerState>,
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, TrainingError> {
    fs::create_dir_all(request.results_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create results directory {}: {err}",
            request.results_dir.display()
        ))
    })?;

    let final_dir = request.results_dir.join(request.milestone.directory_name());
    let previous_dir = previous_directory(request.results_dir, request.milestone);
    let staging_dir = request
        .results_dir
        .join(format!(".{}.partial", request.milestone.directory_name()));
    recover_interrupted_swap(&final_dir, &previous_dir)?;
    if staging_dir.exists() {
        remove_dir(&staging_dir)?;
    }
    fs::create_dir(&staging_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            staging_dir.display()
        ))
    })?;

    let model_path = staging_dir.join(MODEL_FILENAME);
    save_weights(&request.parameters, &model_path)?;
    let model = file_record(&model_path)?;

    let (ema, ema_state) = match &request.ema {
        Some(snapshot) => {
            let weights_path = staging_dir.join(EMA_FILENAME);
            save_weights(&snapshot.parameters, &weights_path)?;
            let state_path = staging_dir.join(EMA_STATE_FILENAME);
            write_json(&state_path, &snapshot.state)?;
            (
                Some(file_record(&weights_path)?),
                Some(file_record(&state_path)?),
            )
        }
        None => (None, None),
    };

    let optimizer_path = staging_dir.join(OPTIMIZER_FILENAME);
    write_json(&optimizer_path, &request.optimizer.state()?)?;
    let optimizer = file_record(&optimizer_path)?;

    let scheduler = match request.scheduler {
        Some(scheduler) => {
            let path = staging_dir.join(SCHEDULER_FILENAME);
            write_json(&path, &scheduler.snapshot())?;
            Some(file_record(&path)?)
        }
        None => None,
    };

    let scaler_path = staging_dir.join(SCALER_FILENAME);
    write_json(&scaler_path, &request.scaler.state())?;
    let scaler = file_record(&scaler_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        config_sha256: fingerprint_config(request.config)?,
        milestone: request.milestone.to_string(),
        step: request.step,
        loss: request.loss,
        model,
        ema,
        ema_state,
        optimizer,
        scheduler,
        scaler,
    };
    write_json(&staging_dir.join(MANIFEST_FILENAME), &manifest)?;

    if final_dir.exists() {
        rename_dir(&final_dir, &previous_dir)?;
    }
    rename_dir(&staging_dir, &final_dir)?;
    if previous_dir.exists() {
        remove_dir(&previous_dir)?;
    }

    Ok(CheckpointDescriptor {
        directory: final_dir,
        manifest,
    })
}

/// Accepts either a checkpoint directory path or a milestone name relative to
/// `results_dir`.
pub fn resolve_checkpoint(results_dir: &Path, identifier: &str) -> Result<PathBuf, TrainingError> {
    let direct = PathBuf::from(identifier);
    if direct.join(MANIFEST_FILENAME).is_file() {
        return Ok(direct);
    }
    let milestone: Milestone = identifier.parse()?;
    locate_checkpoint(results_dir, milestone).ok_or_else(|| {
        TrainingError::runtime(format!(
            "no checkpoint found for '{identifier}' (looked in {})",
            results_dir.join(milestone.directory_name()).display()
        ))
    })
}

/// Directory holding `milestone`, falling back to the copy left aside by a save
/// that was interrupted mid-swap.
pub fn locate_checkpoint(results_dir: &Path, milestone: Milestone) -> Option<PathBuf> {
    [
        results_dir.join(milestone.directory_name()),
        previous_directory(results_dir, milestone),
    ]
    .into_iter()
    .find(|candidate| candidate.join(MANIFEST_FILENAME).is_file())
}

fn previous_directory(results_dir: &Path, milestone: Milestone) -> PathBuf {
    results_dir.join(format!(".{}.previous", milestone.directory_name()))
}

/// Puts the previous copy back when the swap stopped before the new directory
/// landed, and drops it when the new one is already complete.
fn recover_interrupted_swap(final_dir: &Path, previous_dir: &Path) -> Result<(), TrainingError> {
    if !previous_dir.exists() {
        return Ok(());
    }
    if final_dir.join(MANIFEST_FILENAME).is_file() {
        return remove_dir(previous_dir);
    }
    log::warn!(
        "restoring {} left behind by an interrupted save",
        previous_dir.display()
    );
    if final_dir.exists() {
        remove_dir(final_dir)?;
    }
    rename_dir(previous_dir, final_dir)
}

/// Validates every recorded file against its checksum. Optional pieces that were
/// never written come back as `None`.
pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, TrainingError> {
    let manifest = read_manifest(directory)?;
    ensure_version_supported(manifest.version)?;

    let model_weights_path = directory.join(&manifest.model.filename);
    validate_file(&model_weights_path, &manifest.model.sha256)?;

    let ema_weights_path = match &manifest.ema {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            Some(path)
        }
        None => None,
    };
    let ema_state = read_optional::<EmaState>(directory, manifest.ema_state.as_ref())?;
    let optimizer_state = read_optional::<OptimizerState>(directory, Some(&manifest.optimizer))?;
    let scheduler_state = read_optional::<SchedulerState>(directory, manifest.scheduler.as_ref())?;
    let scaler_state = read_optional::<GradientScalerState>(directory, Some(&manifest.scaler))?;

    Ok(LoadOutcome {
        directory: directory.to_path_buf(),
        manifest,
        model_weights_path,
        ema_weights_path,
        ema_state,
        optimizer_state,
        scheduler_state,
        scaler_state,
    })
}

/// Binds safetensors weights to `parameters` by canonical name.
pub fn apply_weights(
    parameters: &[(String, Var)],
    weights_path: &Path,
    device: &Device,
) -> Result<(), TrainingError> {
    let tensors = load_safetensors(weights_path, device).map_err(candle_to_training_error)?;
    let mut by_name: HashMap<String, Tensor> = tensors
        .into_iter()
        .map(|(name, tensor)| (canonical_name(&name).to_string(), tensor))
        .collect();

    for (name, var) in parameters {
        let tensor = by_name.remove(canonical_name(name)).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "checkpoint parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let tensor = tensor
            .to_dtype(var.as_tensor().dtype())
            .map_err(candle_to_training_error)?;
        var.set(&tensor).map_err(candle_to_training_error)?;
    }

    if !by_name.is_empty() {
        let mut extra = by_name.into_keys().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

/// Loads the weights used for sampling: the EMA shadow when present and
/// requested, the live model otherwise.
pub fn load_inference_weights(
    directory: &Path,
    parameters: &[(String, Var)],
    device: &Device,
    prefer_ema: bool,
) -> Result<LoadOutcome, TrainingError> {
    let outcome = load_checkpoint(directory)?;
    match (&outcome.ema_weights_path, prefer_ema) {
        (Some(path), true) => apply_weights(parameters, path, device)?,
        (None, true) => {
            log::warn!(
                "checkpoint {} has no ema weights; using the live model",
                directory.display()
            );
            apply_weights(parameters, &outcome.model_weights_path, device)?
        }
        (_, false) => apply_weights(parameters, &outcome.model_weights_path, device)?,
    }
    Ok(outcome)
}

/// Strips any leading wrapper prefixes so names match across runtimes.
pub fn canonical_name(name: &str) -> &str {
    let mut current = name;
    loop {
        let stripped = WRAPPER_PREFIXES
            .iter()
            .find_map(|prefix| current.strip_prefix(prefix));
        match stripped {
            Some(rest) => current = rest,
            None => return current,
        }
    }
}

fn save_weights(parameters: &[(String, Var)], path: &Path) -> Result<(), TrainingError> {
    if parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, Tensor> = parameters
        .iter()
        .map(|(name, var)| (canonical_name(name).to_string(), var.as_tensor().detach()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize weights to {}: {err}",
            path.display()
        ))
    })
}

fn read_optional<T: for<'de> Deserialize<'de>>(
    directory: &Path,
    record: Option<&FileRecord>,
) -> Result<Option<T>, TrainingError> {
    let Some(record) = record else {
        return Ok(None);
    };
    let path = directory.join(&record.filename);
    if !path.is_file() {
        log::warn!("checkpoint file {} is missing", path.display());
        return Ok(None);
    }
    validate_file(&path, &record.sha256)?;
    read_json(&path).map(Some)
}

fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn rename_dir(from: &Path, to: &Path) -> Result<(), TrainingError> {
    fs::rename(from, to).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move checkpoint {} to {}: {err}",
            from.display(),
            to.display()
        ))
    })
}

fn remove_dir(path: &Path) -> Result<(), TrainingError> {
    fs::remove_dir_all(path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to remove checkpoint directory {}: {err}",
            path.display()
        ))
    })
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

pub fn read_manifest(directory: &Path) -> Result<CheckpointManifest, TrainingError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn ensure_version_supported(version: u32) -> Result<(), TrainingError> {
    if version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {version} (expected {CHECKPOINT_VERSION})"
        )));
    }
    Ok(())
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn candle_to_training_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
