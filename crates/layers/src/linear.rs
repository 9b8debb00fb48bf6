//! Affine projection layer.
//!
//! Inputs may have any rank of at least two; the projection acts on the last
//! axis and leading axes are flattened into rows for a single matmul. This is
//! what lets attention project head-split tensors `(batch, seq, heads,
//! head_dim)` with one `head_dim -> head_dim` weight shared across heads.
//! Weights and activations are cast to [`PrecisionPolicy::compute`] for the
//! matmul and the result is returned in the storage dtype.

use candle_core::{DType, Device, Error, Result, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a biased projection.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }

    /// Creates a configuration for a projection without bias.
    pub fn without_bias(input_dim: usize, output_dim: usize) -> Self {
        Self {
            bias: false,
            ..Self::new(input_dim, output_dim)
        }
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearInit {
    /// Uniform in `±1/sqrt(fan_in)`, the usual default for dense layers.
    #[default]
    FanInUniform,
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Xavier/Glorot normal initialisation.
    XavierNormal,
    /// Kaiming/He uniform initialisation.
    KaimingUniform { negative_slope: f64 },
}

impl LinearInit {
    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        let weight = match self {
            LinearInit::FanInUniform => {
                let bound = 1.0 / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
            LinearInit::XavierNormal => {
                let std = (2.0f64 / (fan_in + fan_out)).sqrt();
                Tensor::randn(0f32, std as f32, shape, device)?
            }
            LinearInit::KaimingUniform { negative_slope } => {
                let gain = (2.0f64 / (1.0 + negative_slope.powi(2))).sqrt();
                let bound = 3.0f64.sqrt() * gain / fan_in.sqrt();
                Tensor::rand(-bound as f32, bound as f32, shape, device)?
            }
        };
        weight.to_dtype(dtype)
    }

    /// Bias bound paired with the weight policy (zero for the Xavier/Kaiming recipes).
    fn bias_bound(&self, fan_in: usize) -> f64 {
        match self {
            LinearInit::FanInUniform => 1.0 / (fan_in as f64).sqrt(),
            _ => 0.0,
        }
    }
}

/// Dense affine projection with optional bias.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    ///
    /// `weight` is laid out `(output_dim, input_dim)`.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        let weight = Var::from_tensor(&weight)?;
        let bias = bias.as_ref().map(Var::from_tensor).transpose()?;
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    /// Builds a linear layer with randomly initialised weights following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        let bias = if config.bias {
            let bound = init.bias_bound(config.input_dim);
            let bias = if bound > 0.0 {
                Tensor::rand(-bound as f32, bound as f32, config.output_dim, device)?
                    .to_dtype(dtype)?
            } else {
                Tensor::zeros(config.output_dim, dtype, device)?
            };
            Some(bias)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the underlying weight tensor.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Returns the bias tensor if present.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    /// Overwrites the weight in place, e.g. when porting trained parameters.
    pub fn load_weight(&self, value: &Tensor) -> Result<()> {
        Self::validate_weight(&self.config, value)?;
        self.weight.set(&value.to_dtype(self.weight.dtype())?)
    }

    /// Overwrites the bias in place.
    pub fn load_bias(&self, value: &Tensor) -> Result<()> {
        match &self.bias {
            Some(bias) => {
                Self::validate_bias(&self.config, Some(value))?;
                bias.set(&value.to_dtype(bias.dtype())?)
            }
            None => Err(Error::Msg("layer has no bias to load into".into())),
        }
    }

    /// Trainable parameters, named `{scope}.weight` and `{scope}.bias`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = vec![(format!("{scope}.weight"), self.weight.clone())];
        if let Some(bias) = &self.bias {
            params.push((format!("{scope}.bias"), bias.clone()));
        }
        params
    }

    /// Applies the projection over the last axis of `hidden`.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let dims = hidden.dims();
        if dims.len() < 2 {
            return Err(Error::Msg(format!(
                "linear.input: expected rank >= 2, got {dims:?}"
            )));
        }
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;

        let rows: usize = dims[..dims.len() - 1].iter().product();
        let mut out_dims = dims.to_vec();
        if let Some(last) = out_dims.last_mut() {
            *last = self.config.output_dim;
        }

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(self.weight.as_tensor())?.t()?;
        let flat = input.contiguous()?.reshape((rows, self.config.input_dim))?;
        let mut output = flat.matmul(&weight_t)?;

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias.as_tensor())?;
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output.reshape(out_dims)?)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, checks::FLOAT_DTYPES)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, checks::FLOAT_DTYPES)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }
}
