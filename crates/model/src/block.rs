//! Post-norm transformer block shared by the encoder and the decoder.
//!
//! Self- and cross-attention differ only in the arguments: the encoder passes
//! the same tensor as values, keys and queries, the decoder passes encoder
//! output as values/keys.

use attention::{Config as AttentionConfig, MultiHeadAttention};
use candle_core::{Tensor, Var};
use layers::{
    Dropout, FeedForward, FeedForwardConfig, LayerNorm, NormConfig, PostNormResidual,
    PrecisionPolicy,
};

use crate::config::{SeedStream, TransformerConfig};
use crate::error::Result;

/// `attention -> dropout(norm(attn + q)) -> feed-forward -> dropout(norm(ff + x))`.
#[derive(Debug)]
pub struct TransformerBlock {
    attention: MultiHeadAttention,
    attention_residual: PostNormResidual,
    feed_forward: FeedForward,
    feed_forward_residual: PostNormResidual,
    policy: PrecisionPolicy,
}

impl TransformerBlock {
    pub(crate) fn new(config: &TransformerConfig, seeds: &mut SeedStream) -> Result<Self> {
        let dtype = config.storage_dtype();
        let attention = MultiHeadAttention::new(
            AttentionConfig::new(config.embed_size, config.heads),
            &config.init,
            &config.device,
            dtype,
        )?;
        let feed_forward = FeedForward::with_init(
            FeedForwardConfig::with_expansion(
                config.embed_size,
                config.forward_expansion,
                config.activation,
            ),
            &config.init,
            &config.device,
            dtype,
        )?;

        Ok(Self {
            attention,
            attention_residual: post_norm(config, seeds)?,
            feed_forward,
            feed_forward_residual: post_norm(config, seeds)?,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
        })
    }

    pub fn attention(&self) -> &MultiHeadAttention {
        &self.attention
    }

    pub fn forward(
        &self,
        values: &Tensor,
        keys: &Tensor,
        queries: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        self.forward_with_weights(values, keys, queries, mask)
            .map(|(output, _)| output)
    }

    /// Runs the block and also returns the attention weights `[N, H, Q, K]`.
    pub fn forward_with_weights(
        &self,
        values: &Tensor,
        keys: &Tensor,
        queries: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor)> {
        let (attended, weights) = self
            .attention
            .forward_with_weights(values, keys, queries, mask)?;
        let x = self
            .attention_residual
            .forward(&attended, queries, &self.policy)?;
        let expanded = self.feed_forward.forward(&x, &self.policy)?;
        let out = self
            .feed_forward_residual
            .forward(&expanded, &x, &self.policy)?;
        Ok((out, weights))
    }

    pub fn set_training(&self, training: bool) {
        self.attention_residual.set_training(training);
        self.feed_forward_residual.set_training(training);
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.attention.named_parameters(&format!("{scope}.attention"));
        params.extend(self.attention_residual.named_parameters(&format!("{scope}.norm1")));
        params.extend(self.feed_forward.named_parameters(&format!("{scope}.feed_forward")));
        params.extend(
            self.feed_forward_residual
                .named_parameters(&format!("{scope}.norm2")),
        );
        params
    }
}

/// LayerNorm plus dropout, seeded from the next value of `seeds`.
pub(crate) fn post_norm(
    config: &TransformerConfig,
    seeds: &mut SeedStream,
) -> Result<PostNormResidual> {
    let norm = LayerNorm::identity(
        NormConfig {
            hidden_size: config.embed_size,
            epsilon: config.norm_epsilon,
        },
        &config.device,
        config.storage_dtype(),
    )?;
    let dropout = Dropout::new(config.dropout, seeds.next_seed())?;
    Ok(PostNormResidual::new(norm, dropout))
}
