use candle_core::{DType, Device, Tensor};
use rand::{rngs::StdRng, Rng};
use rand_distr::StandardNormal;

use crate::{InterpolantError, Result};

/// Reshapes a per-example vector of length `batch` to `(batch, 1, .., 1)` with the
/// rank of `like`, so it broadcasts over every non-batch dimension.
pub fn per_example(values: &Tensor, like: &Tensor) -> Result<Tensor> {
    let batch = like.dim(0)?;
    if values.elem_count() != batch {
        return Err(InterpolantError::Shape(format!(
            "expected {} per-example values, got {}",
            batch,
            values.elem_count()
        )));
    }
    let mut shape = vec![1usize; like.rank().max(1)];
    shape[0] = batch;
    Ok(values.reshape(shape)?)
}

/// Straight-line path `(1 - t) * x0 + t * x1` with one `t` per example.
pub fn interpolate(x0: &Tensor, x1: &Tensor, t: &Tensor) -> Result<Tensor> {
    ensure_same_shape(x0, x1, "interpolation endpoints")?;
    let t = per_example(&t.to_dtype(x0.dtype())?, x0)?;
    let one_minus_t = t.affine(-1.0, 1.0)?;
    Ok((x0.broadcast_mul(&one_minus_t)? + x1.broadcast_mul(&t)?)?)
}

/// Selects `fresh` for examples whose `keep` flag is set and `fallback` otherwise.
///
/// `keep` is a `u8` vector of length `batch`; it is broadcast over all non-batch
/// dimensions of the blended tensors, so the same flags serve samples and latents
/// of different rank.
pub fn bernoulli_blend(fresh: &Tensor, fallback: &Tensor, keep: &Tensor) -> Result<Tensor> {
    ensure_same_shape(fresh, fallback, "blend operands")?;
    let fallback = fallback.to_dtype(fresh.dtype())?;
    let mask = per_example(keep, fresh)?.broadcast_as(fresh.shape())?;
    Ok(mask.where_cond(fresh, &fallback)?)
}

pub(crate) fn ensure_same_shape(a: &Tensor, b: &Tensor, what: &str) -> Result<()> {
    if a.dims() != b.dims() {
        return Err(InterpolantError::Shape(format!(
            "{what}: {:?} vs {:?}",
            a.dims(),
            b.dims()
        )));
    }
    Ok(())
}

pub(crate) fn uniform_times(rng: &mut StdRng, batch: usize, device: &Device) -> Result<Tensor> {
    let values: Vec<f32> = (0..batch).map(|_| rng.gen::<f32>()).collect();
    Ok(Tensor::from_vec(values, batch, device)?)
}

pub(crate) fn keep_flags(
    rng: &mut StdRng,
    batch: usize,
    probability: f64,
    device: &Device,
) -> Result<Tensor> {
    let values: Vec<u8> = (0..batch)
        .map(|_| u8::from(rng.gen_bool(probability)))
        .collect();
    Ok(Tensor::from_vec(values, batch, device)?)
}

/// Independent standard normal draws shaped and typed like `like`.
pub fn standard_normal_like(rng: &mut StdRng, like: &Tensor) -> Result<Tensor> {
    let values: Vec<f32> = (0..like.elem_count())
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(values, like.dims(), like.device())?.to_dtype(like.dtype())?)
}

pub(crate) fn mean_squared_error(prediction: &Tensor, target: &Tensor) -> Result<Tensor> {
    ensure_same_shape(prediction, target, "velocity prediction")?;
    let prediction = prediction.to_dtype(DType::F32)?;
    let target = target.to_dtype(DType::F32)?;
    Ok((prediction - target)?.sqr()?.mean_all()?)
}
