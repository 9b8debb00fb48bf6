//! Boolean attention masks.
//!
//! Masks have dtype [`MASK_DTYPE`] and a 4-D layout that broadcasts to
//! `[batch, heads, q_len, k_len]`. A value of `1` allows attention and `0`
//! forbids it. Forbidden scores are overwritten with [`MASK_FILL_VALUE`]
//! rather than `-inf`, so a fully masked row degrades to a uniform
//! distribution instead of `NaN`.

pub mod causal;
pub mod padding;

use candle_core::{DType, Result, Tensor, D};

/// Dtype shared by all masks produced here.
pub const MASK_DTYPE: DType = DType::U8;

/// Score written into forbidden positions before the softmax.
pub const MASK_FILL_VALUE: f64 = -1e20;

pub use causal::build_target_mask;
pub use padding::build_source_mask;

/// Converts any 0/non-zero mask into a strict `0`/`1` [`MASK_DTYPE`] tensor.
pub fn normalize_mask(mask: &Tensor) -> Result<Tensor> {
    mask.ne(&mask.zeros_like()?)
}

/// Replaces every score whose mask entry is `0` with `value`.
///
/// `mask` must broadcast to the shape of `scores`.
pub fn masked_fill(scores: &Tensor, mask: &Tensor, value: f64) -> Result<Tensor> {
    let keep = normalize_mask(mask)?.broadcast_as(scores.dims())?;
    let fill = Tensor::full(value, scores.dims(), scores.device())?.to_dtype(scores.dtype())?;
    keep.where_cond(scores, &fill)
}

/// Counts query rows in which every key is forbidden.
///
/// Rows are counted on the mask as given; broadcast it to `[N, H, Q, K]`
/// first to count one row per head and query position.
pub fn count_fully_masked_rows(mask: &Tensor) -> Result<usize> {
    let keep = normalize_mask(mask)?;
    let attendable = keep.max_keepdim(D::Minus1)?.to_dtype(DType::U32)?;
    let rows = attendable.elem_count();
    let open = attendable.sum_all()?.to_scalar::<u32>()? as usize;
    Ok(rows - open)
}
