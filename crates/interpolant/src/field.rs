use candle_core::Tensor;

/// A time-conditioned vector field `b(x, t, latent)`.
///
/// `state` has shape `(batch, ...)`, `time` is a rank-1 tensor of length `batch`
/// and the returned velocity must have the shape of `state`.
pub trait VelocityField {
    fn forward(
        &self,
        state: &Tensor,
        time: &Tensor,
        latent: Option<&Tensor>,
    ) -> candle_core::Result<Tensor>;

    /// Evaluation whose result participates in the gradient graph. Used only for the
    /// regression prediction inside the loss.
    fn velocity_tracked(
        &self,
        state: &Tensor,
        time: &Tensor,
        latent: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        self.forward(state, time, latent)
    }

    /// Evaluation cut from the gradient graph. Transport always goes through here.
    fn velocity_detached(
        &self,
        state: &Tensor,
        time: &Tensor,
        latent: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        Ok(self.forward(state, time, latent)?.detach())
    }
}

/// Adapts a closure into a [`VelocityField`].
pub struct VelocityFn<F>(pub F);

impl<F> VelocityField for VelocityFn<F>
where
    F: Fn(&Tensor, &Tensor, Option<&Tensor>) -> candle_core::Result<Tensor>,
{
    fn forward(
        &self,
        state: &Tensor,
        time: &Tensor,
        latent: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        (self.0)(state, time, latent)
    }
}
