//! Multi-head attention and the boolean masks that drive it.
//!
//! Activations use the `[batch, seq_len, embed_size]` layout. Masks are `u8`
//! tensors broadcastable to `[batch, heads, q_len, k_len]` where `1` allows
//! attention; see [`masks`] for the source (padding) and target (causal)
//! builders.

pub mod core;
pub mod masks;
pub mod multi_head;

pub use core::{AttentionError, Config};
pub use masks::{build_source_mask, build_target_mask, count_fully_masked_rows};
pub use multi_head::MultiHeadAttention;
