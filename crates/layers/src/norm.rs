//! Layer normalisation over the feature axis.
//!
//! Statistics (mean, variance) are computed in [`PrecisionPolicy::reduction`]
//! and the affine scale/shift in [`PrecisionPolicy::compute`]; the result is
//! cast back to storage. The layout of the input is preserved.

use candle_core::{DType, Device, Error, Result, Tensor, Var, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for [`LayerNorm`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the feature dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
        }
    }
}

/// LayerNorm with learnable scale and shift.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Var,
    bias: Var,
}

impl LayerNorm {
    /// Constructs a LayerNorm from existing scale and shift parameters.
    pub fn new(weight: Tensor, bias: Tensor, config: NormConfig) -> Result<Self> {
        if config.hidden_size == 0 {
            return Err(Error::Msg("norm.hidden_size must be greater than zero".into()));
        }
        if !(config.epsilon > 0.0) {
            return Err(Error::Msg(format!(
                "norm.epsilon must be positive, got {}",
                config.epsilon
            )));
        }
        for (label, tensor) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            checks::expect_shape(label, tensor, &[config.hidden_size])?;
            checks::expect_dtype_in(label, tensor, checks::FLOAT_DTYPES)?;
        }
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: Var::from_tensor(&bias)?,
        })
    }

    /// Identity-initialised LayerNorm (scale = 1, shift = 0).
    pub fn identity(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        let bias = Tensor::zeros(config.hidden_size, dtype, device)?;
        Self::new(weight, bias, config)
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![
            (format!("{scope}.weight"), self.weight.clone()),
            (format!("{scope}.bias"), self.bias.clone()),
        ]
    }

    /// Normalises `hidden` along its last axis.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let compute = policy.cast_for_reduction(hidden)?;
        let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
        let centered = compute.broadcast_sub(&mean)?;
        let variance = (centered.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let normalized = policy.cast_for_matmul(&centered.broadcast_div(&denom)?)?;

        let weight = self.weight.to_dtype(normalized.dtype())?;
        let bias = self.bias.to_dtype(normalized.dtype())?;
        let out = normalized.broadcast_mul(&weight)?.broadcast_add(&bias)?;
        policy.cast_to_storage(&out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::ops;

    fn build_input(device: &Device, dtype: DType, dims: (usize, usize, usize)) -> Result<Tensor> {
        let total = dims.0 * dims.1 * dims.2;
        let data = (0..total)
            .map(|i| (i as f32 * 0.25_f32) - 1.5_f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, dims, device)?.to_dtype(dtype)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn layer_norm_matches_candle_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 4;
        let weight_f32 = Tensor::from_vec(vec![1.0f32, 0.5, -0.25, 1.5], (hidden,), &device)?;
        let bias_f32 = Tensor::from_vec(vec![0.1f32, -0.2, 0.05, 0.0], (hidden,), &device)?;

        for (dtype, tol) in [(DType::F32, 5e-4), (DType::F16, 1e-2), (DType::BF16, 5e-2)] {
            let input = build_input(&device, dtype, (2, 3, hidden))?;
            let weight = weight_f32.to_dtype(dtype)?;
            let bias = bias_f32.to_dtype(dtype)?;
            let layer = LayerNorm::new(weight, bias, NormConfig::new(hidden))?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = layer.forward(&input, &policy)?;

            assert_eq!(output.dims(), input.dims());
            assert_eq!(output.dtype(), dtype);

            let reference = ops::layer_norm(
                &input.to_dtype(DType::F32)?,
                &weight_f32,
                &bias_f32,
                1e-5,
            )?;
            let diff = max_diff(&output, &reference)?;
            assert!(diff < tol, "max diff {diff} for dtype {dtype:?}");
        }
        Ok(())
    }

    #[test]
    fn identity_norm_yields_zero_mean_unit_variance() -> Result<()> {
        let device = Device::Cpu;
        for &(batch, seq, hidden) in &[(1, 1, 2), (2, 3, 16), (1, 4, 256)] {
            let layer = LayerNorm::identity(NormConfig::new(hidden), &device, DType::F32)?;
            let input = build_input(&device, DType::F32, (batch, seq, hidden))?;
            let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
            let out = layer.forward(&input, &policy)?;

            let mean = out.mean_keepdim(D::Minus1)?.abs()?.max_all()?.to_vec0::<f32>()?;
            assert!(mean < 1e-4, "mean {mean} for {:?}", (batch, seq, hidden));
            let var = out
                .sqr()?
                .mean_keepdim(D::Minus1)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            assert!(var.iter().all(|v| (v - 1.0).abs() < 1e-2));
        }
        Ok(())
    }

    #[test]
    fn rejects_mismatched_parameters() -> Result<()> {
        let device = Device::Cpu;
        let weight = Tensor::ones(3, DType::F32, &device)?;
        let bias = Tensor::zeros(4, DType::F32, &device)?;
        assert!(LayerNorm::new(weight, bias, NormConfig::new(4)).is_err());

        let layer = LayerNorm::identity(NormConfig::new(4), &device, DType::F32)?;
        let input = Tensor::zeros((1, 2, 5), DType::F32, &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert!(layer.forward(&input, &policy).is_err());
        Ok(())
    }
}
