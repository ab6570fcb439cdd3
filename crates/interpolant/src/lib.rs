//! Stochastic-interpolant machinery for learning to invert a known corruption.
//!
//! A [`VelocityField`] is trained so that integrating it from time 1 (corrupted
//! observation) back to time 0 recovers a sample from the clean distribution. The
//! [`DeconvolvingInterpolant`] bootstraps its own training pairs: it transports the
//! observation to a pseudo-clean sample, re-corrupts that sample with the
//! [`ForwardOperator`], and regresses the velocity along the straight path between
//! the two. [`FollmerInterpolant`] is the stochastic-bridge variant behind the same
//! [`Interpolant`] trait.

pub mod deconvolving;
pub mod errors;
pub mod field;
pub mod follmer;
pub mod operator;
pub mod path;
pub mod transport;

mod engine;

pub use deconvolving::DeconvolvingInterpolant;
pub use engine::{Interpolant, InterpolantSettings, LossOutput};
pub use errors::{InterpolantError, Result};
pub use field::{VelocityField, VelocityFn};
pub use follmer::FollmerInterpolant;
pub use operator::{Corruption, ForwardOperator};
pub use path::{bernoulli_blend, interpolate, per_example, standard_normal_like};
pub use transport::{euler_trajectory, euler_transport};
