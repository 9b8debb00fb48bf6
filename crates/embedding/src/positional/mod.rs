//! Positional embeddings.

pub mod learned;
