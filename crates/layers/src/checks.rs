//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `label` naming the tensor being checked so errors
//! read like `linear.input: expected last dim 8, got [2, 3, 4]`. They return
//! `candle_core::Result<()>` so call sites can propagate with `?`.

use candle_core::{DType, Error, Result, Tensor};

/// Floating point dtypes accepted for parameters and activations.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32, DType::F64];

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Ensures a tensor has exactly `rank` dimensions.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    let dims = tensor.dims();
    if dims.len() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected rank {rank}, got shape {dims:?}"
        )))
    }
}

/// Ensures the trailing (feature) dimension equals `size`.
pub fn expect_last_dim(label: &str, tensor: &Tensor, size: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == size => Ok(()),
        _ => Err(Error::Msg(format!(
            "{label}: expected last dim {size}, got {:?}",
            tensor.dims()
        ))),
    }
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(label: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == hidden => Ok(()),
        dims => Err(Error::Msg(format!(
            "{label}: expected (batch, seq, {hidden}) layout, got {dims:?}"
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Checks two tensors share a dtype.
pub fn expect_same_dtype(label: &str, lhs: &Tensor, other: &str, rhs: &Tensor) -> Result<()> {
    if lhs.dtype() == rhs.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{label} has dtype {:?} but {other} has {:?}",
            lhs.dtype(),
            rhs.dtype()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shape_errors_name_the_tensor() -> Result<()> {
        let t = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu)?;
        expect_shape("probe", &t, &[2, 3, 4])?;
        expect_last_dim("probe", &t, 4)?;
        expect_batch_seq_hidden("probe", &t, 4)?;

        let err = expect_last_dim("probe", &t, 5).unwrap_err();
        assert!(err.to_string().contains("probe: expected last dim 5"));
        assert!(expect_rank("probe", &t, 2).is_err());
        Ok(())
    }

    #[test]
    fn dtype_checks_reject_integers() -> Result<()> {
        let t = Tensor::zeros((2,), DType::U32, &Device::Cpu)?;
        assert!(expect_dtype_in("ids", &t, FLOAT_DTYPES).is_err());
        let f = Tensor::zeros((2,), DType::F32, &Device::Cpu)?;
        assert!(expect_same_dtype("ids", &t, "floats", &f).is_err());
        Ok(())
    }
}
