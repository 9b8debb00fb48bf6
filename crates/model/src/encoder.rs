//! Encoder stack and the embedding stage it shares with the decoder.

use candle_core::{Tensor, Var};
use embedding::{
    PositionalEmbedding, PositionalEmbeddingConfig, TokenEmbedding, TokenEmbeddingConfig,
};
use layers::{Dropout, PrecisionPolicy};

use crate::block::TransformerBlock;
use crate::config::{SeedStream, TransformerConfig};
use crate::error::Result;

/// `dropout(word_embedding(tokens) + position_embedding(0..len))`.
#[derive(Debug)]
pub struct EmbeddingStage {
    word_embedding: TokenEmbedding,
    position_embedding: PositionalEmbedding,
    dropout: Dropout,
    policy: PrecisionPolicy,
}

impl EmbeddingStage {
    pub(crate) fn new(
        vocab_size: usize,
        config: &TransformerConfig,
        seeds: &mut SeedStream,
    ) -> Result<Self> {
        let dtype = config.storage_dtype();
        let word_embedding = TokenEmbedding::new(TokenEmbeddingConfig {
            vocab_size,
            hidden_dim: config.embed_size,
            dtype,
            device: config.device.clone(),
        })?;
        let position_embedding = PositionalEmbedding::new(PositionalEmbeddingConfig {
            max_length: config.max_length,
            hidden_dim: config.embed_size,
            dtype,
            device: config.device.clone(),
        })?;
        Ok(Self {
            word_embedding,
            position_embedding,
            dropout: Dropout::new(config.dropout, seeds.next_seed())?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    /// Embeds `[batch, len]` token ids into `[batch, len, embed_size]`.
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let words = self.word_embedding.forward(tokens)?;
        let (batch, seq_len, _) = words.dims3()?;
        let positions = self.position_embedding.forward(batch, seq_len)?;
        let summed = self
            .policy
            .cast_for_matmul(&words)?
            .add(&self.policy.cast_for_matmul(&positions)?)?;
        let summed = self.policy.cast_to_storage(&summed)?;
        Ok(self.dropout.forward(&summed, &self.policy)?)
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self
            .word_embedding
            .named_parameters(&format!("{scope}.word_embedding"));
        params.extend(
            self.position_embedding
                .named_parameters(&format!("{scope}.position_embedding")),
        );
        params
    }
}

/// Embedding stage followed by `num_layers` self-attention blocks.
#[derive(Debug)]
pub struct Encoder {
    embedding: EmbeddingStage,
    layers: Vec<TransformerBlock>,
}

impl Encoder {
    pub(crate) fn new(config: &TransformerConfig, seeds: &mut SeedStream) -> Result<Self> {
        let embedding = EmbeddingStage::new(config.src_vocab_size, config, seeds)?;
        let layers = (0..config.num_layers)
            .map(|_| TransformerBlock::new(config, seeds))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { embedding, layers })
    }

    pub fn layers(&self) -> &[TransformerBlock] {
        &self.layers
    }

    /// Encodes `[batch, src_len]` tokens; `src_mask` hides padded keys.
    pub fn forward(&self, src: &Tensor, src_mask: &Tensor) -> Result<Tensor> {
        let mut out = self.embedding.forward(src)?;
        for layer in &self.layers {
            out = layer.forward(&out, &out, &out, Some(src_mask))?;
        }
        Ok(out)
    }

    pub fn set_training(&self, training: bool) {
        self.embedding.set_training(training);
        for layer in &self.layers {
            layer.set_training(training);
        }
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.embedding.named_parameters(scope);
        for (index, layer) in self.layers.iter().enumerate() {
            params.extend(layer.named_parameters(&format!("{scope}.layers.{index}")));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use attention::build_source_mask;
    use candle_core::Device;

    fn config() -> TransformerConfig {
        TransformerConfig {
            embed_size: 8,
            heads: 2,
            num_layers: 2,
            max_length: 6,
            ..TransformerConfig::new(12, 12, 0, 0)
        }
    }

    #[test]
    fn encodes_to_embed_size() -> Result<()> {
        let encoder = Encoder::new(&config(), &mut SeedStream::new(1))?;
        let src = Tensor::from_vec(vec![3i64, 4, 5, 0, 6, 7, 8, 9], (2, 4), &Device::Cpu)?;
        let mask = build_source_mask(&src, 0)?;
        let out = encoder.forward(&src, &mask)?;
        assert_eq!(out.dims(), &[2, 4, 8]);
        assert_eq!(encoder.layers().len(), 2);
        Ok(())
    }

    #[test]
    fn rejects_sequences_longer_than_position_table() -> Result<()> {
        let encoder = Encoder::new(&config(), &mut SeedStream::new(1))?;
        let src = Tensor::ones((1, 7), candle_core::DType::I64, &Device::Cpu)?;
        let mask = build_source_mask(&src, 0)?;
        assert!(matches!(encoder.forward(&src, &mask), Err(ModelError::Range(_))));
        Ok(())
    }

    #[test]
    fn zero_layers_return_the_embedding() -> Result<()> {
        let encoder = Encoder::new(
            &TransformerConfig {
                num_layers: 0,
                ..config()
            },
            &mut SeedStream::new(1),
        )?;
        let src = Tensor::from_vec(vec![1i64, 2, 3], (1, 3), &Device::Cpu)?;
        let mask = build_source_mask(&src, 0)?;
        let out = encoder.forward(&src, &mask)?;
        let expected = encoder.embedding.forward(&src)?;
        let diff = out.sub(&expected)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }
}
