//! Activations used between the two projections of the feed-forward block.
//!
//! Each implementation promotes its input to the compute dtype requested by
//! [`PrecisionPolicy`] before evaluating the non-linearity, then casts the
//! result back to storage.
//!
//! * **ReLU** `max(x, 0)`, the classic encoder-decoder choice.
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.

use std::sync::Arc;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Identity function, useful for debugging.
    Identity,
    #[default]
    Relu,
    Gelu,
}

/// Common interface shared by feed-forward activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Built-in activation backed by Candle kernels.
struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        match self.kind {
            ActivationKind::Identity => policy.cast_to_storage(input),
            ActivationKind::Relu => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.relu()?)
            }
            ActivationKind::Gelu => {
                let compute = policy.cast_for_matmul(input)?;
                policy.cast_to_storage(&compute.gelu_erf()?)
            }
        }
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}
