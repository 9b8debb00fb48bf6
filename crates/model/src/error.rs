//! Error taxonomy for the assembled model.

use attention::AttentionError;
use embedding::EmbeddingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Hyperparameters cannot produce a valid model.
    #[error("invalid model configuration: {0}")]
    Configuration(String),
    /// Inputs do not follow the documented layouts.
    #[error("invalid tensor shape: {0}")]
    Shape(String),
    /// A token id or sequence length exceeds a table size.
    #[error("value out of range: {0}")]
    Range(String),
    /// Reading or writing a configuration file failed.
    #[error("config file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;

impl From<AttentionError> for ModelError {
    fn from(err: AttentionError) -> Self {
        match err {
            AttentionError::Configuration { message } => Self::Configuration(message),
            AttentionError::Shape { context } => Self::Shape(context),
            AttentionError::Backend(inner) => Self::Backend(inner),
        }
    }
}

impl From<EmbeddingError> for ModelError {
    fn from(err: EmbeddingError) -> Self {
        match err {
            EmbeddingError::OutOfRange { .. } | EmbeddingError::SequenceTooLong { .. } => {
                Self::Range(err.to_string())
            }
            EmbeddingError::InvalidShape { context } => Self::Shape(context),
            EmbeddingError::Backend(inner) => Self::Backend(inner),
        }
    }
}
