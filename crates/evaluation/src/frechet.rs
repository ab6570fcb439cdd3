//! Fréchet distance between two Gaussians fit to feature populations:
//!
//! `d² = |μ1 - μ2|² + tr(Σ1) + tr(Σ2) - 2 tr √(Σ1 Σ2)`
//!
//! `tr √(Σ1 Σ2)` is the sum of the principal square roots of the eigenvalues of
//! the product, read off its real Schur form.

use nalgebra::{Complex, DMatrix, Schur};

use crate::{statistics::FeatureStatistics, EvaluationError, Result};

pub const DEFAULT_EPS: f64 = 1e-6;
const IMAGINARY_TOLERANCE: f64 = 1e-3;
const SCHUR_MAX_ITERATIONS: usize = 10_000;

pub fn frechet_distance(
    generated: &FeatureStatistics,
    reference: &FeatureStatistics,
    eps: f64,
) -> Result<f64> {
    if generated.dim != reference.dim {
        return Err(EvaluationError::Shape(format!(
            "generated features have dimension {}, reference has {}",
            generated.dim, reference.dim
        )));
    }

    let mu1 = generated.mean_vector();
    let mu2 = reference.mean_vector();
    let sigma1 = generated.covariance_matrix();
    let sigma2 = reference.covariance_matrix();

    let diff = &mu1 - &mu2;
    let trace_sqrt = match trace_sqrt_product(&sigma1, &sigma2) {
        Some(trace) => trace,
        None => {
            log::warn!(
                "fid calculation produces singular product; adding {eps} to diagonal of cov estimates"
            );
            let offset = DMatrix::<f64>::identity(generated.dim, generated.dim) * eps;
            trace_sqrt_product(&(&sigma1 + &offset), &(&sigma2 + &offset))
                .ok_or(EvaluationError::Singular { eps })?
        }
    };

    Ok(diff.dot(&diff) + sigma1.trace() + sigma2.trace() - 2.0 * trace_sqrt)
}

/// `None` when the product has no usable eigen-decomposition.
fn trace_sqrt_product(sigma1: &DMatrix<f64>, sigma2: &DMatrix<f64>) -> Option<f64> {
    let product = sigma1 * sigma2;
    if product.iter().any(|value| !value.is_finite()) {
        return None;
    }
    let schur = Schur::try_new(product, f64::EPSILON, SCHUR_MAX_ITERATIONS)?;
    let eigenvalues = schur.complex_eigenvalues();
    if eigenvalues
        .iter()
        .any(|value| !(value.re.is_finite() && value.im.is_finite()))
    {
        return None;
    }

    let total = eigenvalues
        .iter()
        .fold(Complex::new(0.0, 0.0), |acc, value| acc + value.sqrt());
    if total.im.abs() > IMAGINARY_TOLERANCE {
        log::warn!(
            "matrix square root has imaginary component {:.3e}; keeping the real part",
            total.im
        );
    }
    Some(total.re)
}
