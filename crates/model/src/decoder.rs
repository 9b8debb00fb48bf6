//! Decoder blocks and the decoder stack.

use attention::{Config as AttentionConfig, MultiHeadAttention};
use candle_core::{Tensor, Var};
use layers::{Linear, LinearConfig, PostNormResidual, PrecisionPolicy};

use crate::block::{post_norm, TransformerBlock};
use crate::config::{SeedStream, TransformerConfig};
use crate::encoder::EmbeddingStage;
use crate::error::Result;

/// Masked self-attention followed by a cross-attending [`TransformerBlock`].
///
/// The causal target mask only reaches the self-attention and the source
/// padding mask only reaches the cross-attention.
#[derive(Debug)]
pub struct DecoderBlock {
    attention: MultiHeadAttention,
    residual: PostNormResidual,
    transformer_block: TransformerBlock,
    policy: PrecisionPolicy,
}

impl DecoderBlock {
    pub(crate) fn new(config: &TransformerConfig, seeds: &mut SeedStream) -> Result<Self> {
        let dtype = config.storage_dtype();
        let attention = MultiHeadAttention::new(
            AttentionConfig::new(config.embed_size, config.heads),
            &config.init,
            &config.device,
            dtype,
        )?;
        Ok(Self {
            attention,
            residual: post_norm(config, seeds)?,
            transformer_block: TransformerBlock::new(config, seeds)?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn self_attention(&self) -> &MultiHeadAttention {
        &self.attention
    }

    pub fn transformer_block(&self) -> &TransformerBlock {
        &self.transformer_block
    }

    pub fn forward(
        &self,
        x: &Tensor,
        enc_out: &Tensor,
        src_mask: &Tensor,
        trg_mask: &Tensor,
    ) -> Result<Tensor> {
        let attended = self.attention.forward(x, x, x, Some(trg_mask))?;
        let query = self.residual.forward(&attended, x, &self.policy)?;
        self.transformer_block
            .forward(enc_out, enc_out, &query, Some(src_mask))
    }

    pub fn set_training(&self, training: bool) {
        self.residual.set_training(training);
        self.transformer_block.set_training(training);
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.attention.named_parameters(&format!("{scope}.attention"));
        params.extend(self.residual.named_parameters(&format!("{scope}.norm")));
        params.extend(
            self.transformer_block
                .named_parameters(&format!("{scope}.transformer_block")),
        );
        params
    }
}

/// Embedding stage, `num_layers` decoder blocks and the vocabulary projection.
#[derive(Debug)]
pub struct Decoder {
    embedding: EmbeddingStage,
    layers: Vec<DecoderBlock>,
    fc_out: Linear,
    policy: PrecisionPolicy,
}

impl Decoder {
    pub(crate) fn new(config: &TransformerConfig, seeds: &mut SeedStream) -> Result<Self> {
        let dtype = config.storage_dtype();
        let embedding = EmbeddingStage::new(config.trg_vocab_size, config, seeds)?;
        let layers = (0..config.num_layers)
            .map(|_| DecoderBlock::new(config, seeds))
            .collect::<Result<Vec<_>>>()?;
        let fc_out = Linear::with_init(
            LinearConfig::new(config.embed_size, config.trg_vocab_size),
            &config.init,
            &config.device,
            dtype,
        )?;
        Ok(Self {
            embedding,
            layers,
            fc_out,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn layers(&self) -> &[DecoderBlock] {
        &self.layers
    }

    /// Returns raw logits `[batch, trg_len, trg_vocab_size]`.
    pub fn forward(
        &self,
        trg: &Tensor,
        enc_out: &Tensor,
        src_mask: &Tensor,
        trg_mask: &Tensor,
    ) -> Result<Tensor> {
        let mut x = self.embedding.forward(trg)?;
        for layer in &self.layers {
            x = layer.forward(&x, enc_out, src_mask, trg_mask)?;
        }
        Ok(self.fc_out.forward(&x, &self.policy)?)
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
        params.extend(self.fc_out.named_parameters(&format!("{scope}.fc_out")));
        params
    }
}
