//! Embedding tables for the encoder and decoder stacks.
//!
//! [`TokenEmbedding`] maps integer ids `(batch, seq)` to `(batch, seq, hidden)`
//! vectors; [`PositionalEmbedding`] is a learned table indexed by position
//! `0..seq_len` and broadcast across the batch. Both validate their indices
//! and report violations as [`EmbeddingError`] range variants.

pub mod error;
pub mod positional;
pub mod token;

pub use error::EmbeddingError;
pub use positional::learned::{PositionalEmbedding, PositionalEmbeddingConfig};
pub use token::{TokenEmbedding, TokenEmbeddingConfig};
