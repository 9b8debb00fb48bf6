//! Token embedding table.

use candle_core::{DType, Device, Tensor, Var};
use layers::PrecisionPolicy;

use crate::error::{EmbeddingError, Result};

/// Configuration for building a token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbeddingConfig {
    /// Size of the vocabulary (number of distinct tokens).
    pub vocab_size: usize,
    /// Dimensionality of each embedding vector.
    pub hidden_dim: usize,
    /// Storage dtype used for the underlying parameters and outputs.
    pub dtype: DType,
    /// Device hosting the parameters.
    pub device: Device,
}

/// Learnable token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Var,
}

impl TokenEmbedding {
    /// Builds a new token embedding table with parameters sampled from `N(0, 1)`.
    pub fn new(config: TokenEmbeddingConfig) -> Result<Self> {
        if config.vocab_size == 0 || config.hidden_dim == 0 {
            return Err(EmbeddingError::InvalidShape {
                context: format!(
                    "token embedding requires non-zero vocab_size and hidden_dim, got {}x{}",
                    config.vocab_size, config.hidden_dim
                ),
            });
        }

        let shape = (config.vocab_size, config.hidden_dim);
        let initial = Tensor::randn(0f32, 1f32, shape, &config.device)?.to_dtype(config.dtype)?;
        let weight = Var::from_tensor(&initial)?;
        Ok(Self { config, weight })
    }

    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    /// Returns the underlying weight tensor.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Returns the trainable parameters for this embedding under `scope`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{scope}.weight"), self.weight.clone())]
    }

    /// Looks up embeddings for the provided token ids.
    ///
    /// Inputs must be shaped `(batch, seq)` with an integer dtype. Outputs follow the
    /// `(batch, seq, hidden)` layout using the configured storage dtype.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = validate_token_ids(token_ids)?;

        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;

        let gathered = self.weight.as_tensor().index_select(&flat, 0)?;
        let policy = PrecisionPolicy::from_parameter_dtype(self.config.dtype);
        let out = gathered.reshape((batch, seq, self.config.hidden_dim))?;
        Ok(policy.cast_to_storage(&out)?)
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            return Err(EmbeddingError::OutOfRange {
                id: min_id,
                vocab_size: self.config.vocab_size,
            });
        }
        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        if max_id >= self.config.vocab_size as i64 {
            return Err(EmbeddingError::OutOfRange {
                id: max_id,
                vocab_size: self.config.vocab_size,
            });
        }
        Ok(())
    }
}

/// Checks `(batch, seq)` layout with non-zero extents and an integer dtype.
pub(crate) fn validate_token_ids(token_ids: &Tensor) -> Result<(usize, usize)> {
    let (batch, seq) = match token_ids.dims() {
        [batch, seq] if *batch > 0 && *seq > 0 => (*batch, *seq),
        dims => {
            return Err(EmbeddingError::InvalidShape {
                context: format!("token ids must be shaped [batch, seq] with non-zero extents, got {dims:?}"),
            })
        }
    };
    if !token_ids.dtype().is_int() {
        return Err(EmbeddingError::InvalidShape {
            context: format!(
                "token ids expected an integer dtype but received {:?}",
                token_ids.dtype()
            ),
        });
    }
    Ok((batch, seq))
}
