//! Corruption operators and clean data sources for deconvolution experiments.

mod corruption;
mod dataset;
mod distributions;
mod errors;

use std::path::Path;

use candle_core::{Device, Tensor};

pub use corruption::{build_operator, CorruptionKind, GaussianNoise, RandomMask, RandomProjection};
pub use dataset::TensorDataset;
pub use distributions::{Checkerboard, GaussianMixture, TwoMoons};
pub use errors::{DataError, Result};

/// A sampler of clean examples, shaped `(count, feature_shape...)`.
pub trait CleanSource: Send + Sync {
    fn name(&self) -> String;

    fn feature_shape(&self) -> Vec<usize>;

    fn sample(&self, count: usize, device: &Device) -> Result<Tensor>;

    /// Number of features per example once flattened.
    fn feature_dim(&self) -> usize {
        self.feature_shape().iter().product()
    }
}

/// Resolves a dataset identifier. Synthetic names ignore `path`; anything else
/// is read from `path` as a safetensors file keyed by the dataset name.
pub fn build_source(
    name: &str,
    path: Option<&Path>,
    seed: u64,
) -> Result<Box<dyn CleanSource>> {
    let source: Box<dyn CleanSource> = match name.to_ascii_lowercase().as_str() {
        "checker" | "checkerboard" => Box::new(Checkerboard::new(seed)),
        "moon" | "moons" => Box::new(TwoMoons::new(0.1, seed)),
        "gmm" => Box::new(GaussianMixture::ring(seed)),
        _ => match path {
            Some(path) => Box::new(TensorDataset::open(path, name, seed)?),
            None => return Err(DataError::UnknownDataset(name.to_string())),
        },
    };
    log::info!(
        "clean source '{}' with feature shape {:?}",
        source.name(),
        source.feature_shape()
    );
    Ok(source)
}
