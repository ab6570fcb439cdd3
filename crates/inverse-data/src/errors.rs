use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("unknown corruption '{0}'")]
    UnknownCorruption(String),

    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),

    #[error("invalid corruption levels for '{name}': {reason}")]
    InvalidLevels { name: String, reason: String },

    #[error("dataset file not found: {0}")]
    MissingDataset(PathBuf),

    #[error("dataset error: {0}")]
    Dataset(String),
}

pub type Result<T> = std::result::Result<T, DataError>;
