//! Multi-head scaled dot-product attention.
//!
//! Inputs use the `[batch, seq_len, embed_size]` layout. Each head sees a
//! `head_dim` slice of the embedding and the value/key/query projections are
//! `head_dim -> head_dim` maps shared by every head and position. Scores are
//! scaled by `1 / sqrt(embed_size)` after masking.

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::ops::softmax_last_dim;
use layers::{checks, Linear, LinearConfig, LinearInit, PrecisionPolicy};

use crate::core::{AttentionError, Config};
use crate::masks::{self, MASK_FILL_VALUE};

/// Multi-head attention with per-head shared projections and a biased output
/// projection.
#[derive(Debug)]
pub struct MultiHeadAttention {
    config: Config,
    head_dim: usize,
    scale: f64,
    values: Linear,
    keys: Linear,
    queries: Linear,
    fc_out: Linear,
    policy: PrecisionPolicy,
    first_call: OnceLock<()>,
}

impl MultiHeadAttention {
    /// Builds the four projections; fails when `embed_size` is not an exact
    /// multiple of `heads`.
    pub fn new(
        config: Config,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let head_dim = config.validate()?;
        let head = LinearConfig::without_bias(head_dim, head_dim);
        let values = Linear::with_init(head.clone(), init, device, dtype)?;
        let keys = Linear::with_init(head.clone(), init, device, dtype)?;
        let queries = Linear::with_init(head, init, device, dtype)?;
        let fc_out = Linear::with_init(
            LinearConfig::new(config.embed_size, config.embed_size),
            init,
            device,
            dtype,
        )?;

        Ok(Self {
            config,
            head_dim,
            scale: config.score_scale(),
            values,
            keys,
            queries,
            fc_out,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn values_projection(&self) -> &Linear {
        &self.values
    }

    pub fn keys_projection(&self) -> &Linear {
        &self.keys
    }

    pub fn queries_projection(&self) -> &Linear {
        &self.queries
    }

    pub fn output_projection(&self) -> &Linear {
        &self.fc_out
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.values.named_parameters(&format!("{scope}.values"));
        params.extend(self.keys.named_parameters(&format!("{scope}.keys")));
        params.extend(self.queries.named_parameters(&format!("{scope}.queries")));
        params.extend(self.fc_out.named_parameters(&format!("{scope}.fc_out")));
        params
    }

    /// Attends `queries` over `keys`/`values` and returns `[batch, q_len, embed_size]`.
    ///
    /// `mask`, when present, must broadcast to `[batch, heads, q_len, k_len]`;
    /// zero entries forbid attention.
    pub fn forward(
        &self,
        values: &Tensor,
        keys: &Tensor,
        queries: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        self.forward_with_weights(values, keys, queries, mask)
            .map(|(output, _)| output)
    }

    /// Same as [`forward`](Self::forward) but also returns the attention
    /// distribution shaped `[batch, heads, q_len, k_len]` in the reduction dtype.
    pub fn forward_with_weights(
        &self,
        values: &Tensor,
        keys: &Tensor,
        queries: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::debug!(
                "attention::multi_head init embed_size={} heads={} head_dim={} scale={:.6} dtype={:?}",
                self.config.embed_size,
                self.config.heads,
                self.head_dim,
                self.scale,
                self.policy.storage()
            );
        }

        let (batch, q_len, k_len) = self.validate_inputs(values, keys, queries)?;
        if let Some(mask) = mask {
            self.validate_mask(mask, queries.device(), batch, q_len, k_len)?;
        }

        let heads = self.config.heads;
        let merged = batch * heads;

        // [N, L, E] -> [N, L, H, D] -> projection -> [N*H, L, D]
        let v = self.project_heads(&self.values, values, k_len)?;
        let k = self.project_heads(&self.keys, keys, k_len)?;
        let q = self.project_heads(&self.queries, queries, q_len)?;

        let k_t = k.transpose(1, 2)?.contiguous()?;
        let mut scores = q.matmul(&k_t)?.reshape((batch, heads, q_len, k_len))?;

        if let Some(mask) = mask {
            if cfg!(debug_assertions) {
                // Count on the broadcast shape so every head and query position is one row.
                let expanded = mask.broadcast_as(scores.dims())?;
                let degenerate = masks::count_fully_masked_rows(&expanded)?;
                if degenerate > 0 {
                    let total = batch * heads * q_len;
                    log::warn!(
                        "attention mask forbids every key for {degenerate} of {total} query \
                         row(s) across heads; those rows fall back to a uniform distribution"
                    );
                }
            }
            scores = masks::masked_fill(&scores, mask, MASK_FILL_VALUE)?;
        }

        let scaled = self
            .policy
            .cast_for_reduction(&scores.affine(self.scale, 0.0)?)?
            .contiguous()?;
        let weights = softmax_last_dim(&scaled)?;

        let mixed = self
            .policy
            .cast_for_matmul(&weights)?
            .reshape((merged, q_len, k_len))?
            .matmul(&v)?;
        let merged_heads = mixed
            .reshape((batch, heads, q_len, self.head_dim))?
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch, q_len, self.config.embed_size))?;

        let output = self
            .fc_out
            .forward(&self.policy.cast_to_storage(&merged_heads)?, &self.policy)?;
        Ok((output, weights))
    }

    fn project_heads(
        &self,
        projection: &Linear,
        input: &Tensor,
        seq_len: usize,
    ) -> Result<Tensor, AttentionError> {
        let batch = input.dim(0)?;
        let heads = self.config.heads;
        let split = input.reshape((batch, seq_len, heads, self.head_dim))?;
        let projected = projection.forward(&split, &self.policy)?;
        let per_head = self
            .policy
            .cast_for_matmul(&projected)?
            .permute((0, 2, 1, 3))?
            .contiguous()?
            .reshape((batch * heads, seq_len, self.head_dim))?;
        Ok(per_head)
    }

    fn validate_inputs(
        &self,
        values: &Tensor,
        keys: &Tensor,
        queries: &Tensor,
    ) -> Result<(usize, usize, usize), AttentionError> {
        let embed = self.config.embed_size;
        for (label, tensor) in [("values", values), ("keys", keys), ("queries", queries)] {
            checks::expect_batch_seq_hidden(label, tensor, embed)
                .map_err(|err| AttentionError::shape(err.to_string()))?;
            checks::expect_dtype_in(label, tensor, checks::FLOAT_DTYPES)
                .map_err(|err| AttentionError::shape(err.to_string()))?;
            if !tensor.device().same_device(queries.device()) {
                return Err(AttentionError::shape(format!(
                    "{label} must reside on the same device as queries"
                )));
            }
        }
        for (label, tensor) in [("values", values), ("keys", keys)] {
            checks::expect_same_dtype(label, tensor, "queries", queries)
                .map_err(|err| AttentionError::shape(err.to_string()))?;
        }

        let (batch, q_len, _) = queries.dims3()?;
        let (key_batch, k_len, _) = keys.dims3()?;
        let (value_batch, v_len, _) = values.dims3()?;
        if key_batch != batch || value_batch != batch {
            return Err(AttentionError::shape(format!(
                "batch mismatch: queries={batch} keys={key_batch} values={value_batch}"
            )));
        }
        if k_len != v_len {
            return Err(AttentionError::shape(format!(
                "key length {k_len} must equal value length {v_len}"
            )));
        }
        Ok((batch, q_len, k_len))
    }

    fn validate_mask(
        &self,
        mask: &Tensor,
        device: &Device,
        batch: usize,
        q_len: usize,
        k_len: usize,
    ) -> Result<(), AttentionError> {
        let expected = [batch, self.config.heads, q_len, k_len];
        let dims = mask.dims();
        let broadcasts = dims.len() == expected.len()
            && dims
                .iter()
                .zip(expected.iter())
                .all(|(&got, &want)| got == want || got == 1);
        if !broadcasts {
            return Err(AttentionError::shape(format!(
                "mask shaped {dims:?} cannot broadcast to {expected:?}"
            )));
        }
        if !mask.device().same_device(device) {
            return Err(AttentionError::shape(
                "mask must reside on the same device as queries",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::{build_source_mask, build_target_mask};

    fn mha(embed: usize, heads: usize) -> MultiHeadAttention {
        MultiHeadAttention::new(
            Config::new(embed, heads),
            &LinearInit::default(),
            &Device::Cpu,
            DType::F32,
        )
        .expect("valid attention config")
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        a.sub(b)
            .and_then(|d| d.abs())
            .and_then(|d| d.max_all())
            .and_then(|d| d.to_vec0::<f32>())
            .expect("diff")
    }

    #[test]
    fn self_attention_preserves_layout() -> Result<(), AttentionError> {
        let attention = mha(16, 4);
        let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu)?;
        let (out, weights) = attention.forward_with_weights(&x, &x, &x, None)?;
        assert_eq!(out.dims(), &[2, 5, 16]);
        assert_eq!(weights.dims(), &[2, 4, 5, 5]);
        assert_eq!(attention.head_dim(), 4);
        Ok(())
    }

    #[test]
    fn cross_attention_uses_key_length() -> Result<(), AttentionError> {
        let attention = mha(12, 3);
        let memory = Tensor::randn(0f32, 1.0, (2, 9, 12), &Device::Cpu)?;
        let queries = Tensor::randn(0f32, 1.0, (2, 4, 12), &Device::Cpu)?;
        let (out, weights) = attention.forward_with_weights(&memory, &memory, &queries, None)?;
        assert_eq!(out.dims(), &[2, 4, 12]);
        assert_eq!(weights.dims(), &[2, 3, 4, 9]);
        Ok(())
    }

    #[test]
    fn rows_sum_to_one() -> Result<(), AttentionError> {
        let attention = mha(8, 2);
        let x = Tensor::randn(0f32, 1.0, (3, 6, 8), &Device::Cpu)?;
        let (_, weights) = attention.forward_with_weights(&x, &x, &x, None)?;
        let sums = weights.sum(3)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
        Ok(())
    }

    #[test]
    fn causal_mask_zeroes_future_keys() -> Result<(), AttentionError> {
        let attention = mha(8, 2);
        let x = Tensor::randn(0f32, 1.0, (2, 5, 8), &Device::Cpu)?;
        let mask = build_target_mask(2, 5, &Device::Cpu)?;
        let (_, weights) = attention.forward_with_weights(&x, &x, &x, Some(&mask))?;

        for b in 0..2 {
            for h in 0..2 {
                let grid = weights.get(b)?.get(h)?.to_vec2::<f32>()?;
                for (q, row) in grid.iter().enumerate() {
                    for &w in &row[q + 1..] {
                        assert!(w.abs() < 1e-12, "future weight leaked: {w}");
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn padded_keys_receive_no_weight() -> Result<(), AttentionError> {
        let attention = mha(8, 4);
        let src = Tensor::from_vec(vec![3i64, 4, 0, 0, 5, 6, 7, 0], (2, 4), &Device::Cpu)?;
        let mask = build_source_mask(&src, 0)?;
        let x = Tensor::randn(0f32, 1.0, (2, 4, 8), &Device::Cpu)?;
        let (_, weights) = attention.forward_with_weights(&x, &x, &x, Some(&mask))?;

        let first = weights.get(0)?.narrow(2, 2, 2)?;
        let second = weights.get(1)?.narrow(2, 3, 1)?;
        assert!(first.abs()?.max_all()?.to_vec0::<f32>()? < 1e-12);
        assert!(second.abs()?.max_all()?.to_vec0::<f32>()? < 1e-12);
        Ok(())
    }

    #[test]
    fn fully_masked_row_is_uniform() -> Result<(), AttentionError> {
        let attention = mha(4, 2);
        let src = Tensor::from_vec(vec![0i64, 0, 0], (1, 3), &Device::Cpu)?;
        let mask = build_source_mask(&src, 0)?;
        let x = Tensor::randn(0f32, 1.0, (1, 3, 4), &Device::Cpu)?;
        let (out, weights) = attention.forward_with_weights(&x, &x, &x, Some(&mask))?;

        let values = weights.flatten_all()?.to_vec1::<f32>()?;
        assert!(values.iter().all(|w| (w - 1.0 / 3.0).abs() < 1e-6));
        let finite = out.flatten_all()?.to_vec1::<f32>()?;
        assert!(finite.iter().all(|v| v.is_finite()));
        Ok(())
    }

    #[test]
    fn forward_matches_forward_with_weights() -> Result<(), AttentionError> {
        let attention = mha(8, 2);
        let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &Device::Cpu)?;
        let out = attention.forward(&x, &x, &x, None)?;
        let (paired, _) = attention.forward_with_weights(&x, &x, &x, None)?;
        assert_eq!(max_abs_diff(&out, &paired), 0.0);
        Ok(())
    }

    #[test]
    fn projections_are_shared_across_heads() -> Result<(), AttentionError> {
        let attention = mha(8, 2);
        let device = Device::Cpu;
        let identity = Tensor::eye(4, DType::F32, &device)?;
        for projection in [
            attention.values_projection(),
            attention.keys_projection(),
            attention.queries_projection(),
        ] {
            assert_eq!(projection.weight().dims(), &[4, 4]);
            assert!(projection.bias().is_none());
            projection.load_weight(&identity)?;
        }
        attention.output_projection().load_weight(&Tensor::eye(8, DType::F32, &device)?)?;
        attention
            .output_projection()
            .load_bias(&Tensor::zeros(8, DType::F32, &device)?)?;

        // Identical halves give identical heads, so both halves of the output match.
        let half = Tensor::randn(0f32, 1.0, (1, 3, 4), &device)?;
        let x = Tensor::cat(&[&half, &half], 2)?;
        let out = attention.forward(&x, &x, &x, None)?;
        let left = out.narrow(2, 0, 4)?;
        let right = out.narrow(2, 4, 4)?;
        assert!(max_abs_diff(&left, &right) < 1e-6);
        Ok(())
    }

    #[test]
    fn scale_uses_full_embed_size() -> Result<(), AttentionError> {
        let attention = mha(4, 4);
        let device = Device::Cpu;
        for projection in [attention.keys_projection(), attention.queries_projection()] {
            projection.load_weight(&Tensor::ones((1, 1), DType::F32, &device)?)?;
        }
        // Two keys with scores 2 and 0 per head; scale 1/sqrt(4) leaves logits 1 and 0.
        let keys = Tensor::from_vec(vec![2f32, 2., 2., 2., 0., 0., 0., 0.], (1, 2, 4), &device)?;
        let queries = Tensor::ones((1, 1, 4), DType::F32, &device)?;
        let (_, weights) = attention.forward_with_weights(&keys, &keys, &queries, None)?;
        let expected = 1f32.exp() / (1f32.exp() + 1.0);
        let first = weights.flatten_all()?.to_vec1::<f32>()?[0];
        assert!((first - expected).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn indivisible_heads_fail_construction() {
        let result = MultiHeadAttention::new(
            Config::new(10, 3),
            &LinearInit::default(),
            &Device::Cpu,
            DType::F32,
        );
        assert!(matches!(result, Err(AttentionError::Configuration { .. })));
    }

    #[test]
    fn mismatched_shapes_are_rejected() -> Result<(), AttentionError> {
        let attention = mha(8, 2);
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 3, 8), DType::F32, &device)?;
        let other_batch = Tensor::zeros((1, 3, 8), DType::F32, &device)?;
        let short_values = Tensor::zeros((2, 2, 8), DType::F32, &device)?;
        let wrong_width = Tensor::zeros((2, 3, 6), DType::F32, &device)?;
        let flat = Tensor::zeros((6, 8), DType::F32, &device)?;

        let cases = [
            attention.forward(&x, &x, &other_batch, None),
            attention.forward(&short_values, &x, &x, None),
            attention.forward(&x, &x, &wrong_width, None),
            attention.forward(&flat, &flat, &flat, None),
        ];
        for case in cases {
            assert!(matches!(case, Err(AttentionError::Shape { .. })));
        }

        let bad_mask = Tensor::ones((2, 1, 3, 4), DType::U8, &device)?;
        let rank_three = Tensor::ones((2, 3, 3), DType::U8, &device)?;
        for mask in [&bad_mask, &rank_three] {
            assert!(matches!(
                attention.forward(&x, &x, &x, Some(mask)),
                Err(AttentionError::Shape { .. })
            ));
        }
        Ok(())
    }

    #[test]
    fn half_precision_computes_in_f32() -> Result<(), AttentionError> {
        let attention = MultiHeadAttention::new(
            Config::new(8, 2),
            &LinearInit::default(),
            &Device::Cpu,
            DType::F16,
        )?;
        let x = Tensor::randn(0f32, 1.0, (1, 4, 8), &Device::Cpu)?.to_dtype(DType::F16)?;
        let mask = build_target_mask(1, 4, &Device::Cpu)?;
        let (out, weights) = attention.forward_with_weights(&x, &x, &x, Some(&mask))?;
        assert_eq!(out.dtype(), DType::F16);
        assert_eq!(weights.dtype(), DType::F32);
        Ok(())
    }

    #[test]
    fn parameters_follow_projection_names() {
        let names: Vec<String> = mha(8, 2)
            .named_parameters("attn")
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec![
                "attn.values.weight",
                "attn.keys.weight",
                "attn.queries.weight",
                "attn.fc_out.weight",
                "attn.fc_out.bias",
            ]
        );
    }
}
