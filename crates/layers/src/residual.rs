//! Residual connections and dropout.
//!
//! The encoder-decoder blocks use the post-norm layout
//! `dropout(norm(branch + residual))`; [`PostNormResidual`] packages that
//! step. [`Dropout`] is shared with the embedding stage of each stack.
//! Both operands of a residual addition must have identical shapes.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use candle_core::{Error, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy, norm::LayerNorm};

/// Inverted dropout with a seeded generator and a train/eval switch.
///
/// Outputs are scaled by `1 / (1 - p)` during training so the expectation is
/// unchanged; in inference mode the input passes through untouched.
pub struct Dropout {
    probability: f32,
    rng: Mutex<Lcg64>,
    training: AtomicBool,
}

impl Clone for Dropout {
    fn clone(&self) -> Self {
        let state = match self.rng.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Self {
            probability: self.probability,
            rng: Mutex::new(state),
            training: AtomicBool::new(self.is_training()),
        }
    }
}

impl fmt::Debug for Dropout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropout")
            .field("probability", &self.probability)
            .field("training", &self.is_training())
            .finish()
    }
}

impl Dropout {
    /// Creates a dropout site; `probability` must lie in `[0, 1)`.
    pub fn new(probability: f32, seed: u64) -> Result<Self> {
        if !(0.0..1.0).contains(&probability) {
            return Err(Error::Msg(format!(
                "dropout probability must be in [0, 1), got {probability}"
            )));
        }
        Ok(Self {
            probability,
            rng: Mutex::new(Lcg64::new(seed)),
            training: AtomicBool::new(true),
        })
    }

    pub fn probability(&self) -> f32 {
        self.probability
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Enables or disables dropout based on training mode.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    pub fn forward(&self, tensor: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if !self.is_training() || self.probability == 0.0 {
            return Ok(tensor.clone());
        }
        let keep_prob = 1.0 - self.probability;
        let total = tensor.elem_count();
        let mask_data = {
            let mut rng = self
                .rng
                .lock()
                .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
            (0..total)
                .map(|_| if rng.next_f32() < keep_prob { 1.0f32 } else { 0.0 })
                .collect::<Vec<_>>()
        };
        let device = tensor.device();
        let compute = policy.cast_for_matmul(tensor)?;
        let mask = Tensor::from_vec(mask_data, tensor.dims(), device)?.to_dtype(compute.dtype())?;
        let dropped = compute.mul(&mask)?.affine(1.0 / f64::from(keep_prob), 0.0)?;
        policy.cast_to_storage(&dropped)
    }
}

/// Adds two `(.., hidden)` tensors of identical shape in the compute dtype.
pub fn residual_add(branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
    checks::expect_shape("residual.branch", branch, residual.dims())?;
    checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;
    let sum = policy
        .cast_for_matmul(branch)?
        .add(&policy.cast_for_matmul(residual)?)?;
    policy.cast_to_storage(&sum)
}

/// Post-norm residual step: `dropout(norm(branch + residual))`.
#[derive(Debug, Clone)]
pub struct PostNormResidual {
    norm: LayerNorm,
    dropout: Dropout,
}

impl PostNormResidual {
    pub fn new(norm: LayerNorm, dropout: Dropout) -> Self {
        Self { norm, dropout }
    }

    pub fn set_training(&self, training: bool) {
        self.dropout.set_training(training);
    }

    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        self.norm.named_parameters(scope)
    }

    pub fn forward(
        &self,
        branch: &Tensor,
        residual: &Tensor,
        policy: &PrecisionPolicy,
    ) -> Result<Tensor> {
        let summed = residual_add(branch, residual, policy)?;
        let normed = self.norm.forward(&summed, policy)?;
        self.dropout.forward(&normed, policy)
    }
}

/// 64-bit linear congruential generator for reproducible dropout masks.
#[derive(Debug, Clone)]
struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth's MMIX constants.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}
