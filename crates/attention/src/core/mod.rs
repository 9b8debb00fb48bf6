//! Configuration and error types shared by the attention layer and masks.

pub mod config;
pub mod errors;

pub use config::Config;
pub use errors::AttentionError;
