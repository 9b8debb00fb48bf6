//! Building blocks for the encoder-decoder transformer.
//!
//! Thin, shape-checked wrappers over Candle primitives: affine projections,
//! layer normalisation, the position-wise feed-forward block, dropout and the
//! post-norm residual step. Every layer routes dtype casts through
//! [`PrecisionPolicy`].

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use activations::ActivationKind;
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use mlp::{FeedForward, FeedForwardConfig};
pub use norm::{LayerNorm, NormConfig};
pub use residual::{residual_add, Dropout, PostNormResidual};
