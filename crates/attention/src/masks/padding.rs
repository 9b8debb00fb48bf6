//! Source padding masks.

use candle_core::{bail, DType, Result, Tensor};

use super::MASK_DTYPE;

/// Builds `[batch, 1, 1, src_len]`, `1` wherever the token is not `pad_idx`.
///
/// The singleton axes broadcast over heads and query positions, so padded
/// keys are hidden from every query.
pub fn build_source_mask(tokens: &Tensor, pad_idx: i64) -> Result<Tensor> {
    let (batch, src_len) = match tokens.dims() {
        [batch, src_len] => (*batch, *src_len),
        dims => bail!("source tokens must be shaped [batch, src_len], got {dims:?}"),
    };
    if !tokens.dtype().is_int() {
        bail!("source tokens must use an integer dtype, got {:?}", tokens.dtype());
    }

    let rows = tokens.to_dtype(DType::I64)?.to_vec2::<i64>()?;
    let data: Vec<u8> = rows
        .iter()
        .flat_map(|row| row.iter().map(|&token| u8::from(token != pad_idx)))
        .collect();

    let mask = Tensor::from_vec(data, (batch, 1, 1, src_len), tokens.device())?;
    debug_assert_eq!(mask.dtype(), MASK_DTYPE);
    Ok(mask)
}
