use candle_core::Tensor;

use crate::{path::ensure_same_shape, InterpolantError, Result, VelocityField};

/// Integrates `dx/dt = b(x, t)` backwards from `t = 1` to `t = 0` with explicit
/// Euler steps of size `1 / steps`.
///
/// Step `i` (counting from 1) evaluates the field at `t = 1 - (i - 1) / steps` and
/// moves `x <- x - b * dt`. The field is always evaluated detached.
pub fn euler_transport(
    field: &dyn VelocityField,
    x: &Tensor,
    latent: Option<&Tensor>,
    steps: usize,
) -> Result<Tensor> {
    integrate(field, x, latent, steps, |_| {})
}

/// Same integration as [`euler_transport`], returning every state including the
/// starting one (`steps + 1` tensors).
pub fn euler_trajectory(
    field: &dyn VelocityField,
    x: &Tensor,
    latent: Option<&Tensor>,
    steps: usize,
) -> Result<Vec<Tensor>> {
    let mut states = Vec::with_capacity(steps + 1);
    states.push(x.detach());
    integrate(field, x, latent, steps, |state| states.push(state.clone()))?;
    Ok(states)
}

fn integrate<F>(
    field: &dyn VelocityField,
    x: &Tensor,
    latent: Option<&Tensor>,
    steps: usize,
    mut record: F,
) -> Result<Tensor>
where
    F: FnMut(&Tensor),
{
    validate_steps(steps)?;
    let batch = x.dim(0)?;
    let dt = 1.0 / steps as f64;
    let mut state = x.detach();
    for i in 1..=steps {
        let time = time_column(1.0 - (i - 1) as f64 * dt, batch, x)?;
        let velocity = field.velocity_detached(&state, &time, latent)?;
        ensure_same_shape(&velocity, &state, "velocity field output")?;
        let velocity = velocity.to_dtype(state.dtype())?;
        state = (state - (velocity * dt)?)?;
        record(&state);
    }
    Ok(state)
}

pub(crate) fn validate_steps(steps: usize) -> Result<()> {
    if steps == 0 {
        return Err(InterpolantError::Config(
            "transport requires at least one step".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn time_column(value: f64, batch: usize, like: &Tensor) -> Result<Tensor> {
    Ok(Tensor::full(value as f32, batch, like.device())?)
}
