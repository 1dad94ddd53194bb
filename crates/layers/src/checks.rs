//! Lightweight validation helpers shared by the kernels and normalisation code.
//!
//! Every check takes a `name` so error messages point at the offending
//! argument. They return `candle_core::Result<()>` so call sites can propagate
//! errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Storage dtypes accepted by the fused kernels.
pub const KERNEL_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(name: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Validates that a tensor can be viewed as a `(rows, cols)` matrix: the last
/// axis equals `cols` and the element count equals `rows * cols`.
pub fn expect_rows_cols(name: &str, tensor: &Tensor, rows: usize, cols: usize) -> Result<()> {
    let dims = tensor.dims();
    let last = dims.last().copied().unwrap_or(0);
    if last == cols && tensor.elem_count() == rows * cols {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected {rows}x{cols} layout, got {:?}",
            dims
        )))
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(name: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Requires two tensors to share a dtype.
pub fn expect_same_dtype(name: &str, tensor: &Tensor, other_name: &str, other: &Tensor) -> Result<()> {
    if tensor.dtype() == other.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{name} ({:?}) and {other_name} ({:?}) must share a dtype",
            tensor.dtype(),
            other.dtype()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn rows_cols_accepts_flattened_and_batched_layouts() -> Result<()> {
        let device = Device::Cpu;
        let flat = Tensor::zeros((6, 4), DType::F32, &device)?;
        let batched = Tensor::zeros((2, 3, 4), DType::F32, &device)?;
        expect_rows_cols("flat", &flat, 6, 4)?;
        expect_rows_cols("batched", &batched, 6, 4)?;
        assert!(expect_rows_cols("flat", &flat, 4, 6).is_err());
        Ok(())
    }

    #[test]
    fn dtype_errors_name_the_argument() -> Result<()> {
        let tensor = Tensor::zeros((2,), DType::U8, &Device::Cpu)?;
        let err = expect_dtype_in("mask", &tensor, KERNEL_DTYPES).unwrap_err();
        assert!(err.to_string().contains("mask"));
        Ok(())
    }

    #[test]
    fn same_dtype_names_both_arguments() -> Result<()> {
        let device = Device::Cpu;
        let half = Tensor::zeros((2,), DType::F16, &device)?;
        let full = Tensor::zeros((2,), DType::F32, &device)?;
        expect_same_dtype("a", &half, "b", &half)?;
        let message = expect_same_dtype("residual", &full, "src", &half).unwrap_err().to_string();
        assert!(message.contains("residual") && message.contains("src"));
        Ok(())
    }
}
