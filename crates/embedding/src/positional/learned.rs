//! Learned absolute positional embeddings.
//!
//! Position `p` of every sequence reads row `p` of a `(max_length, hidden)`
//! table. Positions are generated as `0..seq_len` and broadcast across the
//! batch, so sequences longer than `max_length` are rejected up front.

use candle_core::{DType, Device, Tensor, Var};

use crate::error::{EmbeddingError, Result};

#[derive(Debug, Clone)]
pub struct PositionalEmbeddingConfig {
    /// Number of addressable positions.
    pub max_length: usize,
    pub hidden_dim: usize,
    pub dtype: DType,
    pub device: Device,
}

#[derive(Debug, Clone)]
pub struct PositionalEmbedding {
    config: PositionalEmbeddingConfig,
    weight: Var,
}

impl PositionalEmbedding {
    /// Builds the table with parameters sampled from `N(0, 1)`.
    pub fn new(config: PositionalEmbeddingConfig) -> Result<Self> {
        if config.max_length == 0 || config.hidden_dim == 0 {
            return Err(EmbeddingError::InvalidShape {
                context: format!(
                    "positional embedding requires non-zero max_length and hidden_dim, got {}x{}",
                    config.max_length, config.hidden_dim
                ),
            });
        }
        let shape = (config.max_length, config.hidden_dim);
        let initial = Tensor::randn(0f32, 1f32, shape, &config.device)?.to_dtype(config.dtype)?;
        Ok(Self {
            weight: Var::from_tensor(&initial)?,
            config,
        })
    }

    pub fn config(&self) -> &PositionalEmbeddingConfig {
        &self.config
    }

    pub fn max_length(&self) -> usize {
        self.config.max_length
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{scope}.weight"), self.weight.clone())]
    }

    /// Returns position embeddings shaped `(batch, seq_len, hidden)`.
    pub fn forward(&self, batch: usize, seq_len: usize) -> Result<Tensor> {
        if seq_len > self.config.max_length {
            return Err(EmbeddingError::SequenceTooLong {
                seq_len,
                max_length: self.config.max_length,
            });
        }
        if batch == 0 || seq_len == 0 {
            return Err(EmbeddingError::InvalidShape {
                context: format!("positions need non-zero batch and length, got {batch}x{seq_len}"),
            });
        }
        let positions = Tensor::arange(0u32, seq_len as u32, &self.config.device)?;
        let rows = self.weight.as_tensor().index_select(&positions, 0)?;
        Ok(rows
            .unsqueeze(0)?
            .broadcast_as((batch, seq_len, self.config.hidden_dim))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_length: usize) -> PositionalEmbeddingConfig {
        PositionalEmbeddingConfig {
            max_length,
            hidden_dim: 4,
            dtype: DType::F32,
            device: Device::Cpu,
        }
    }

    #[test]
    fn rows_follow_position_index_and_repeat_across_batch() -> Result<()> {
        let table = PositionalEmbedding::new(config(6))?;
        let out = table.forward(3, 4)?;
        assert_eq!(out.dims(), &[3, 4, 4]);

        let expected = table.weight().narrow(0, 0, 4)?.to_vec2::<f32>()?;
        for b in 0..3 {
            assert_eq!(out.get(b)?.to_vec2::<f32>()?, expected);
        }
        Ok(())
    }

    #[test]
    fn full_range_is_addressable() -> Result<()> {
        let table = PositionalEmbedding::new(config(5))?;
        assert_eq!(table.forward(1, 5)?.dims(), &[1, 5, 4]);
        Ok(())
    }

    #[test]
    fn longer_sequences_are_out_of_range() -> Result<()> {
        let table = PositionalEmbedding::new(config(5))?;
        let err = table.forward(2, 6).unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::SequenceTooLong {
                seq_len: 6,
                max_length: 5
            }
        ));
        Ok(())
    }
}
