use candle_core::{DType, Tensor};

use crate::{EvaluationError, Result};

/// Maps a batch of samples to one feature row per example.
pub trait FeatureExtractor {
    /// Stable identifier; part of the reference-statistics cache key.
    fn name(&self) -> String;

    /// Returns a `(batch, dim)` tensor.
    fn extract(&self, samples: &Tensor) -> Result<Tensor>;
}

/// Identity embedding: each example flattened to a vector. Suitable for
/// low-dimensional data where the raw coordinates are the features.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlattenExtractor;

impl FeatureExtractor for FlattenExtractor {
    fn name(&self) -> String {
        "flatten".to_string()
    }

    fn extract(&self, samples: &Tensor) -> Result<Tensor> {
        if samples.rank() == 0 {
            return Err(EvaluationError::Shape(
                "samples must have a batch dimension".to_string(),
            ));
        }
        let batch = samples.dim(0)?;
        Ok(samples.reshape((batch, ()))?.to_dtype(DType::F64)?)
    }
}

/// Converts an extractor output to rows of `f64`.
pub(crate) fn feature_rows(features: &Tensor) -> Result<Vec<Vec<f64>>> {
    if features.rank() != 2 {
        return Err(EvaluationError::Shape(format!(
            "features must be (batch, dim), got {:?}",
            features.dims()
        )));
    }
    Ok(features.to_dtype(DType::F64)?.to_vec2::<f64>()?)
}
