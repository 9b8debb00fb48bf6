//! Hyperparameters for a multi-head attention layer.

use super::errors::AttentionError;

/// Sizes that define a [`MultiHeadAttention`](crate::MultiHeadAttention) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Model width `E`.
    pub embed_size: usize,
    /// Number of heads `H`; must divide `embed_size` exactly.
    pub heads: usize,
}

impl Config {
    pub fn new(embed_size: usize, heads: usize) -> Self {
        Self { embed_size, heads }
    }

    /// Checks `E = H * D` and returns the head dimension `D`.
    pub fn validate(&self) -> Result<usize, AttentionError> {
        if self.embed_size == 0 || self.heads == 0 {
            return Err(AttentionError::configuration(format!(
                "embed_size ({}) and heads ({}) must be non-zero",
                self.embed_size, self.heads
            )));
        }
        if self.embed_size % self.heads != 0 {
            return Err(AttentionError::configuration(format!(
                "embed_size ({}) must be divisible by heads ({})",
                self.embed_size, self.heads
            )));
        }
        Ok(self.embed_size / self.heads)
    }

    /// Score scale `1 / sqrt(E)`.
    ///
    /// Uses the full embed size rather than the head dimension; trained
    /// parameters depend on this choice.
    pub fn score_scale(&self) -> f64 {
        1.0 / (self.embed_size as f64).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_dim_is_exact_division() {
        assert_eq!(Config::new(256, 8).validate().unwrap(), 32);
        assert_eq!(Config::new(6, 6).validate().unwrap(), 1);
    }

    #[test]
    fn indivisible_or_zero_sizes_are_rejected() {
        for config in [Config::new(10, 3), Config::new(0, 2), Config::new(8, 0)] {
            assert!(matches!(
                config.validate(),
                Err(AttentionError::Configuration { .. })
            ));
        }
    }

    #[test]
    fn scale_uses_embed_size() {
        assert!((Config::new(256, 8).score_scale() - 1.0 / 16.0).abs() < 1e-12);
    }
}
