//! Hyperparameters for the encoder-decoder transformer.
//!
//! Every field has a default so partial TOML/JSON files are accepted;
//! [`TransformerConfig::validate`] reports all violations at once.

use std::{fs, path::Path};

use candle_core::{DType, Device};
use layers::{ActivationKind, LinearInit};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Storage dtype for parameters and activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F16,
    Bf16,
    #[default]
    F32,
    F64,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::F32 => DType::F32,
            Self::F64 => DType::F64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    pub src_vocab_size: usize,
    pub trg_vocab_size: usize,
    /// Source token id treated as padding when building the source mask.
    pub src_pad_idx: i64,
    /// Recorded for checkpoints; the target mask is purely causal.
    pub trg_pad_idx: i64,
    pub embed_size: usize,
    pub num_layers: usize,
    /// Feed-forward width multiplier.
    pub forward_expansion: usize,
    pub heads: usize,
    /// Drop probability shared by every dropout site.
    pub dropout: f32,
    /// Rows in each positional table.
    pub max_length: usize,
    pub activation: ActivationKind,
    pub norm_epsilon: f64,
    /// Base seed for the dropout generators. TOML integers are signed, so
    /// values above `i64::MAX` are rejected by [`TransformerConfig::validate`].
    pub seed: u64,
    pub dtype: Precision,
    /// Weight initialisation for every linear projection.
    pub init: LinearInit,
    #[serde(skip, default = "default_device")]
    pub device: Device,
}

fn default_device() -> Device {
    Device::Cpu
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            src_vocab_size: 0,
            trg_vocab_size: 0,
            src_pad_idx: 0,
            trg_pad_idx: 0,
            embed_size: 256,
            num_layers: 6,
            forward_expansion: 4,
            heads: 8,
            dropout: 0.0,
            max_length: 100,
            activation: ActivationKind::Relu,
            norm_epsilon: 1e-5,
            seed: 0,
            dtype: Precision::F32,
            init: LinearInit::FanInUniform,
            device: default_device(),
        }
    }
}

impl TransformerConfig {
    /// Default hyperparameters for the given vocabularies and padding ids.
    pub fn new(
        src_vocab_size: usize,
        trg_vocab_size: usize,
        src_pad_idx: i64,
        trg_pad_idx: i64,
    ) -> Self {
        Self {
            src_vocab_size,
            trg_vocab_size,
            src_pad_idx,
            trg_pad_idx,
            ..Self::default()
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn storage_dtype(&self) -> DType {
        self.dtype.dtype()
    }

    /// Reads a `.toml` or `.json` file and validates the result.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: Self = match extension(path).as_deref() {
            Some("toml") => toml::from_str(&text).map_err(|err| {
                ModelError::Configuration(format!("failed to parse {}: {err}", path.display()))
            })?,
            Some("json") => serde_json::from_str(&text).map_err(|err| {
                ModelError::Configuration(format!("failed to parse {}: {err}", path.display()))
            })?,
            _ => {
                return Err(ModelError::Configuration(format!(
                    "unsupported config format for {}; expected .toml or .json",
                    path.display()
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates, then writes the configuration as TOML or JSON depending on
    /// the extension. Nothing is written when validation fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate()?;
        let text = match extension(path).as_deref() {
            Some("toml") => toml::to_string_pretty(self)
                .map_err(|err| ModelError::Configuration(err.to_string()))?,
            Some("json") => serde_json::to_string_pretty(self)
                .map_err(|err| ModelError::Configuration(err.to_string()))?,
            _ => {
                return Err(ModelError::Configuration(format!(
                    "unsupported config format for {}; expected .toml or .json",
                    path.display()
                )))
            }
        };
        fs::write(path, text)?;
        Ok(())
    }

    /// Checks every structural invariant and reports all violations together.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.src_vocab_size == 0 {
            problems.push("src_vocab_size must be greater than zero".to_string());
        }
        if self.trg_vocab_size == 0 {
            problems.push("trg_vocab_size must be greater than zero".to_string());
        }
        if self.embed_size == 0 {
            problems.push("embed_size must be greater than zero".to_string());
        }
        if self.heads == 0 {
            problems.push("heads must be greater than zero".to_string());
        } else if self.embed_size % self.heads != 0 {
            problems.push(format!(
                "embed_size ({}) must be divisible by heads ({})",
                self.embed_size, self.heads
            ));
        }
        if self.forward_expansion == 0 {
            problems.push("forward_expansion must be greater than zero".to_string());
        }
        if !(0.0..1.0).contains(&self.dropout) {
            problems.push(format!("dropout must be in [0, 1), got {}", self.dropout));
        }
        if self.max_length == 0 {
            problems.push("max_length must be greater than zero".to_string());
        }
        if !(self.norm_epsilon > 0.0 && self.norm_epsilon.is_finite()) {
            problems.push(format!(
                "norm_epsilon must be a positive finite value, got {}",
                self.norm_epsilon
            ));
        }
        if self.seed > i64::MAX as u64 {
            problems.push(format!(
                "seed must not exceed {} to stay representable in TOML, got {}",
                i64::MAX,
                self.seed
            ));
        }
        if let LinearInit::KaimingUniform { negative_slope } = self.init {
            if !negative_slope.is_finite() {
                problems.push(format!(
                    "init.kaiming_uniform.negative_slope must be finite, got {negative_slope}"
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ModelError::Configuration(problems.join("; ")))
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// Hands out one seed per dropout site so that sites draw independent masks.
#[derive(Debug, Clone)]
pub(crate) struct SeedStream {
    next: u64,
}

impl SeedStream {
    pub(crate) fn new(base: u64) -> Self {
        Self { next: base }
    }

    pub(crate) fn next_seed(&mut self) -> u64 {
        // SplitMix64 increment and finaliser.
        self.next = self.next.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.next;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}
