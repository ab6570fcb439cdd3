use std::path::{Path, PathBuf};

use candle_core::Device;
use hex::encode as hex_encode;
use inverse_data::CleanSource;
use sha2::{Digest, Sha256};

use crate::{
    features::FeatureExtractor,
    statistics::{FeatureAccumulator, FeatureStatistics},
    Result,
};

/// Identifies one reference population.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceKey {
    pub dataset: String,
    pub num_samples: usize,
    pub extractor: String,
    pub seed: u64,
}

impl ReferenceKey {
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dataset.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.extractor.as_bytes());
        hasher.update([0u8]);
        hasher.update((self.num_samples as u64).to_le_bytes());
        hasher.update(self.seed.to_le_bytes());
        hex_encode(hasher.finalize())
    }

    pub fn file_name(&self) -> String {
        format!("fid-stats-{}.json", &self.fingerprint()[..16])
    }
}

/// Reference statistics stored as JSON in one directory, keyed by fingerprint.
#[derive(Debug, Clone)]
pub struct ReferenceCache {
    directory: PathBuf,
}

impl ReferenceCache {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, key: &ReferenceKey) -> PathBuf {
        self.directory.join(key.file_name())
    }

    /// Returns cached statistics for `key`, computing and storing them on a miss.
    /// An unreadable cache file is recomputed and overwritten.
    pub fn load_or_compute(
        &self,
        key: &ReferenceKey,
        source: &dyn CleanSource,
        extractor: &dyn FeatureExtractor,
        batch_size: usize,
        device: &Device,
    ) -> Result<FeatureStatistics> {
        let path = self.path_for(key);
        if path.is_file() {
            match FeatureStatistics::load(&path) {
                Ok(stats) if stats.count == key.num_samples => {
                    log::info!("loaded reference statistics from {}", path.display());
                    return Ok(stats);
                }
                Ok(stats) => log::warn!(
                    "cached statistics at {} cover {} samples, expected {}; recomputing",
                    path.display(),
                    stats.count,
                    key.num_samples
                ),
                Err(err) => log::warn!("ignoring cached statistics: {err}"),
            }
        }

        log::info!(
            "computing reference statistics over {} samples of '{}'",
            key.num_samples,
            key.dataset
        );
        let stats = clean_statistics(source, extractor, key.num_samples, batch_size, device)?;
        stats.save(&path)?;
        log::info!("saved reference statistics to {}", path.display());
        Ok(stats)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

fn clean_statistics(
    source: &dyn CleanSource,
    extractor: &dyn FeatureExtractor,
    num_samples: usize,
    batch_size: usize,
    device: &Device,
) -> Result<FeatureStatistics> {
    let mut accumulator = FeatureAccumulator::default();
    for group in batch_groups(num_samples, batch_size) {
        let clean = source.sample(group, device)?;
        accumulator.push_features(&extractor.extract(&clean)?)?;
    }
    accumulator.finish()
}

/// Splits `total` into groups of at most `batch_size`, the last one holding the
/// remainder.
pub fn batch_groups(total: usize, batch_size: usize) -> Vec<usize> {
    let batch_size = batch_size.max(1);
    let mut groups = vec![batch_size; total / batch_size];
    if total % batch_size != 0 {
        groups.push(total % batch_size);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_cover_the_total() {
        assert_eq!(batch_groups(10, 4), vec![4, 4, 2]);
        assert_eq!(batch_groups(8, 4), vec![4, 4]);
        assert_eq!(batch_groups(3, 8), vec![3]);
        assert!(batch_groups(0, 8).is_empty());
    }

    #[test]
    fn fingerprints_separate_populations() {
        let key = ReferenceKey {
            dataset: "checker".to_string(),
            num_samples: 1000,
            extractor: "flatten".to_string(),
            seed: 1,
        };
        let mut other = key.clone();
        other.num_samples = 2000;
        assert_eq!(key.fingerprint(), key.clone().fingerprint());
        assert_ne!(key.file_name(), other.file_name());
        assert!(key.file_name().starts_with("fid-stats-"));
    }
}
