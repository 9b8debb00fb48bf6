//! Encoder-decoder transformer assembled from the workspace crates.
//!
//! [`Transformer::forward`] maps source and target token ids to raw
//! target-vocabulary logits. The encoder hides source padding through a
//! `[batch, 1, 1, src_len]` mask; the decoder's self-attention is causal and
//! its cross-attention reuses the source mask.

pub mod block;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod model;

pub use block::TransformerBlock;
pub use config::{Precision, TransformerConfig};
pub use decoder::{Decoder, DecoderBlock};
pub use encoder::{EmbeddingStage, Encoder};
pub use error::ModelError;
pub use model::Transformer;
