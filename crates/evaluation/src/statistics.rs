use std::{fs, path::Path};

use candle_core::Tensor;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::{features::feature_rows, EvaluationError, Result};

/// Mean and unbiased covariance of a feature population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStatistics {
    pub dim: usize,
    pub count: usize,
    pub mean: Vec<f64>,
    /// Row-major `dim x dim`.
    pub covariance: Vec<f64>,
}

impl FeatureStatistics {
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let mut accumulator = FeatureAccumulator::default();
        for row in rows {
            accumulator.push_row(row)?;
        }
        accumulator.finish()
    }

    pub fn mean_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.mean)
    }

    pub fn covariance_matrix(&self) -> DMatrix<f64> {
        DMatrix::from_row_slice(self.dim, self.dim, &self.covariance)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let stats: Self = serde_json::from_slice(&fs::read(path)?)?;
        if stats.mean.len() != stats.dim || stats.covariance.len() != stats.dim * stats.dim {
            return Err(EvaluationError::Cache {
                path: path.to_path_buf(),
                reason: format!(
                    "dimension {} does not match mean ({}) or covariance ({})",
                    stats.dim,
                    stats.mean.len(),
                    stats.covariance.len()
                ),
            });
        }
        Ok(stats)
    }
}

/// Collects feature rows batch by batch.
#[derive(Debug, Default)]
pub struct FeatureAccumulator {
    dim: Option<usize>,
    rows: usize,
    values: Vec<f64>,
}

impl FeatureAccumulator {
    pub fn len(&self) -> usize {
        self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn push_features(&mut self, features: &Tensor) -> Result<()> {
        for row in feature_rows(features)? {
            self.push_row(&row)?;
        }
        Ok(())
    }

    pub fn push_row(&mut self, row: &[f64]) -> Result<()> {
        match self.dim {
            Some(dim) if dim != row.len() => {
                return Err(EvaluationError::Shape(format!(
                    "feature row has {} entries, expected {dim}",
                    row.len()
                )));
            }
            Some(_) => {}
            None if row.is_empty() => {
                return Err(EvaluationError::Shape("empty feature row".to_string()));
            }
            None => self.dim = Some(row.len()),
        }
        self.values.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<FeatureStatistics> {
        let (Some(dim), true) = (self.dim, self.rows >= 2) else {
            return Err(EvaluationError::TooFewSamples(self.rows));
        };
        let features = DMatrix::from_row_slice(self.rows, dim, &self.values);
        let mean = features.row_mean();
        let mut centered = features;
        for mut row in centered.row_iter_mut() {
            row -= &mean;
        }
        let covariance = (centered.transpose() * &centered) / (self.rows as f64 - 1.0);

        Ok(FeatureStatistics {
            dim,
            count: self.rows,
            mean: mean.iter().copied().collect(),
            covariance: covariance.transpose().as_slice().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covariance_is_unbiased() {
        let stats =
            FeatureStatistics::from_rows(&[vec![1.0, 2.0], vec![3.0, 2.0], vec![5.0, 8.0]])
                .unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.mean, vec![3.0, 4.0]);
        // x: [-2, 0, 2], y: [-2, -2, 4]
        let expected = [4.0, 6.0, 6.0, 12.0];
        for (value, want) in stats.covariance.iter().zip(expected) {
            assert!((value - want).abs() < 1e-12, "{value} vs {want}");
        }
    }

    #[test]
    fn mismatched_or_missing_rows_are_rejected() {
        let mut accumulator = FeatureAccumulator::default();
        accumulator.push_row(&[1.0, 2.0]).unwrap();
        assert!(accumulator.push_row(&[1.0]).is_err());
        assert!(matches!(
            accumulator.finish(),
            Err(EvaluationError::TooFewSamples(1))
        ));
    }
}
