use thiserror::Error;

#[derive(Debug, Error)]
pub enum InterpolantError {
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("invalid interpolant configuration: {0}")]
    Config(String),

    #[error("latents are enabled but no latent was supplied")]
    MissingLatent,

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("forward operator failed: {0}")]
    Operator(String),
}

pub type Result<T> = std::result::Result<T, InterpolantError>;
