//! The assembled encoder-decoder transformer.

use attention::{build_source_mask, build_target_mask};
use candle_core::{Tensor, Var};

use crate::config::{SeedStream, TransformerConfig};
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::{ModelError, Result};

/// Sequence-to-sequence transformer producing target-vocabulary logits.
#[derive(Debug)]
pub struct Transformer {
    config: TransformerConfig,
    encoder: Encoder,
    decoder: Decoder,
}

impl Transformer {
    /// Validates `config` and builds both stacks with freshly initialised
    /// parameters.
    pub fn new(config: TransformerConfig) -> Result<Self> {
        config.validate()?;
        let mut seeds = SeedStream::new(config.seed);
        let encoder = Encoder::new(&config, &mut seeds)?;
        let decoder = Decoder::new(&config, &mut seeds)?;
        let model = Self {
            config,
            encoder,
            decoder,
        };
        log::info!(
            "model::transformer assembled layers={} embed_size={} heads={} parameters={} dtype={:?}",
            model.config.num_layers,
            model.config.embed_size,
            model.config.heads,
            model.parameter_count(),
            model.config.storage_dtype()
        );
        Ok(model)
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    pub fn decoder(&self) -> &Decoder {
        &self.decoder
    }

    /// `[batch, 1, 1, src_len]` mask hiding `src_pad_idx` tokens.
    pub fn make_src_mask(&self, src: &Tensor) -> Result<Tensor> {
        let (batch, src_len) = token_dims("src", src)?;
        let mask = build_source_mask(src, self.config.src_pad_idx)?;
        debug_assert_eq!(mask.dims(), &[batch, 1, 1, src_len]);
        Ok(mask)
    }

    /// `[batch, 1, trg_len, trg_len]` lower-triangular mask.
    pub fn make_trg_mask(&self, trg: &Tensor) -> Result<Tensor> {
        let (batch, trg_len) = token_dims("trg", trg)?;
        Ok(build_target_mask(batch, trg_len, trg.device())?)
    }

    pub fn encode(&self, src: &Tensor, src_mask: &Tensor) -> Result<Tensor> {
        self.encoder.forward(src, src_mask)
    }

    pub fn decode(
        &self,
        trg: &Tensor,
        enc_out: &Tensor,
        src_mask: &Tensor,
        trg_mask: &Tensor,
    ) -> Result<Tensor> {
        self.decoder.forward(trg, enc_out, src_mask, trg_mask)
    }

    /// Maps `src [batch, src_len]` and `trg [batch, trg_len]` to logits
    /// `[batch, trg_len, trg_vocab_size]`.
    pub fn forward(&self, src: &Tensor, trg: &Tensor) -> Result<Tensor> {
        let (src_batch, _) = token_dims("src", src)?;
        let (trg_batch, _) = token_dims("trg", trg)?;
        if src_batch != trg_batch {
            return Err(ModelError::Shape(format!(
                "src batch {src_batch} does not match trg batch {trg_batch}"
            )));
        }

        let src_mask = self.make_src_mask(src)?;
        let trg_mask = self.make_trg_mask(trg)?;
        let enc_out = self.encode(src, &src_mask)?;
        self.decode(trg, &enc_out, &src_mask, &trg_mask)
    }

    /// Switches every dropout site between training and inference.
    pub fn set_training(&self, training: bool) {
        self.encoder.set_training(training);
        self.decoder.set_training(training);
    }

    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.encoder.named_parameters("encoder");
        params.extend(self.decoder.named_parameters("decoder"));
        params
    }

    pub fn parameter_count(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum()
    }
}

fn token_dims(label: &str, tokens: &Tensor) -> Result<(usize, usize)> {
    if !tokens.dtype().is_int() {
        return Err(ModelError::Shape(format!(
            "{label} tokens must use an integer dtype, got {:?}",
            tokens.dtype()
        )));
    }
    match tokens.dims() {
        [batch, len] if *batch > 0 && *len > 0 => Ok((*batch, *len)),
        dims => Err(ModelError::Shape(format!(
            "{label} tokens must be shaped [batch, len] with non-zero extents, got {dims:?}"
        ))),
    }
}
