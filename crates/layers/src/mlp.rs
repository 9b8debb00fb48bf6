//! Position-wise feed-forward block.
//!
//! Hidden states shaped `(batch, seq, hidden)` are expanded to
//! `intermediate_size`, passed through the activation, and projected back to
//! `hidden`. Both projections carry a bias.

use std::{fmt, sync::Arc};

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{
    activations::{self, Activation, ActivationKind},
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Configuration for [`FeedForward`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
}

impl FeedForwardConfig {
    /// Expand-then-project configuration with `intermediate = expansion * hidden`.
    pub fn with_expansion(hidden_size: usize, expansion: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size: hidden_size * expansion,
            activation,
        }
    }
}

/// Two-layer MLP: `down(act(up(x)))`.
#[derive(Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    up: Linear,
    down: Linear,
    activation: Arc<dyn Activation>,
}

impl fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedForward")
            .field("config", &self.config)
            .finish()
    }
}

impl FeedForward {
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.hidden_size == 0 || config.intermediate_size == 0 {
            return Err(Error::Msg(format!(
                "feed-forward dimensions must be non-zero, got hidden={} intermediate={}",
                config.hidden_size, config.intermediate_size
            )));
        }
        let up = Linear::with_init(
            LinearConfig::new(config.hidden_size, config.intermediate_size),
            init,
            device,
            dtype,
        )?;
        let down = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            init,
            device,
            dtype,
        )?;
        let activation = activations::builtin(config.activation);
        Ok(Self {
            config,
            up,
            down,
            activation,
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.up.named_parameters(&format!("{scope}.up"));
        params.extend(self.down.named_parameters(&format!("{scope}.down")));
        params
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let expanded = self.up.forward(hidden, policy)?;
        let activated = self.activation.forward(&expanded, policy)?;
        self.down.forward(&activated, policy)
    }
}
