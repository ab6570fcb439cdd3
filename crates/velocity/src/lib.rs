pub mod embedding;
pub mod feedforward;

use candle_core::{Device, Var};
use interpolant::VelocityField;

pub use embedding::sinusoidal_embedding;
pub use feedforward::{FeedForwardConfig, FeedForwardVelocity};

/// A trainable velocity field.
///
/// Parameters are exposed by stable names so optimizer state and checkpoints can be
/// bound to them, and `fork` yields an independently owned copy with identical
/// structure and values (used for the EMA shadow).
pub trait VelocityModel: VelocityField + Send {
    fn named_parameters(&self) -> Vec<(String, Var)>;

    fn fork(&self) -> candle_core::Result<Self>
    where
        Self: Sized;

    fn device(&self) -> &Device;

    fn parameter_count(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, var)| var.as_tensor().elem_count())
            .sum()
    }
}
