use candle_core::Tensor;

use crate::Result;

/// Output of a forward operator: the corrupted sample and, for operators that
/// expose one, the side information that parameterised the corruption.
#[derive(Debug, Clone)]
pub struct Corruption {
    pub corrupted: Tensor,
    pub latent: Option<Tensor>,
}

impl Corruption {
    pub fn new(corrupted: Tensor, latent: Option<Tensor>) -> Self {
        Self { corrupted, latent }
    }
}

/// Stochastic corruption `clean -> (corrupted, latent)`.
///
/// Implementations own their randomness; calling `apply` twice on the same input
/// draws fresh corruption each time.
pub trait ForwardOperator: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, clean: &Tensor) -> Result<Corruption>;

    fn corrupt(&self, clean: &Tensor) -> Result<Tensor> {
        Ok(self.apply(clean)?.corrupted)
    }
}
