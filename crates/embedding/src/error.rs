//! Errors raised by embedding lookups.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// A token id falls outside `[0, vocab_size)`.
    #[error("token id {id} out of range for vocabulary of size {vocab_size}")]
    OutOfRange { id: i64, vocab_size: usize },
    /// The sequence is longer than the positional table.
    #[error("sequence length {seq_len} exceeds max positional range {max_length}")]
    SequenceTooLong { seq_len: usize, max_length: usize },
    #[error("invalid embedding input: {context}")]
    InvalidShape { context: String },
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;
