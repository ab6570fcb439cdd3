//! Fréchet-distance evaluation of trained deconvolvers.
//!
//! A checkpoint is rebuilt through the training pipeline, fresh corrupted
//! samples are transported back with its (EMA) velocity field, and the feature
//! statistics of the result are compared against cached statistics of clean
//! data.

pub mod driver;
pub mod errors;
pub mod features;
pub mod frechet;
pub mod reference;
pub mod statistics;

pub use driver::{write_result, EvaluationReport, EvaluationSettings, Evaluator};
pub use errors::{EvaluationError, Result};
pub use features::{FeatureExtractor, FlattenExtractor};
pub use frechet::{frechet_distance, DEFAULT_EPS};
pub use reference::{ReferenceCache, ReferenceKey};
pub use statistics::{FeatureAccumulator, FeatureStatistics};
