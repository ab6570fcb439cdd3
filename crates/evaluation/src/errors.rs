use std::path::PathBuf;

use thiserror::Error;
use training::TrainingError;

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Training(#[from] TrainingError),

    #[error("interpolant error: {0}")]
    Interpolant(#[from] interpolant::InterpolantError),

    #[error("data error: {0}")]
    Data(#[from] inverse_data::DataError),

    #[error("feature shape mismatch: {0}")]
    Shape(String),

    #[error("need at least two feature rows to estimate a covariance (got {0})")]
    TooFewSamples(usize),

    #[error("covariance product stays singular after adding {eps} to the diagonal")]
    Singular { eps: f64 },

    #[error("cached statistics at {path} are unusable: {reason}")]
    Cache { path: PathBuf, reason: String },

    #[error("invalid evaluation settings: {0}")]
    Settings(String),
}

pub type Result<T> = std::result::Result<T, EvaluationError>;
