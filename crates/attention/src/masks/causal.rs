//! Causal (lower-triangular) target masks.

use candle_core::{Device, Result, Tensor};

/// Builds `[batch, 1, trg_len, trg_len]` with `1` on and below the diagonal.
///
/// Query `q` may attend to key `k` only when `k <= q`.
pub fn build_target_mask(batch: usize, trg_len: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0u8; trg_len * trg_len];
    for q in 0..trg_len {
        let row_start = q * trg_len;
        for cell in &mut data[row_start..=row_start + q] {
            *cell = 1;
        }
    }
    Tensor::from_vec(data, (1, 1, trg_len, trg_len), device)?
        .broadcast_as((batch, 1, trg_len, trg_len))?
        .contiguous()
}
