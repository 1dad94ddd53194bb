//! Precision policy for the fused kernels.
//!
//! Inputs live in `f16`/`bf16`/`f32`. Elementwise work and reductions run in
//! `f32`, and results are cast back to the storage dtype of the activation.
//! Layer-norm statistics (mean, variance) and affine parameters stay in the
//! reduction dtype, matching the usual mixed-precision layout where the
//! normalisation parameters are kept in full precision.

use candle_core::{DType, Device, Result, Shape, Tensor};

/// Epsilon values used for comparisons at different stages of a computation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecisionEpsilons {
    /// Tolerance for tensors stored in the activation dtype.
    pub storage: f32,
    /// Tolerance for statistics computed during reductions.
    pub reduction: f32,
}

/// Describes how tensors are cast around a kernel invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Builds a policy from the activation storage dtype.
    pub fn from_storage(storage: DType) -> Self {
        let reduction = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self { storage, reduction }
    }

    /// Returns the dtype activations (and gradients w.r.t. them) are stored in.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for elementwise math and statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Width of one storage element in bytes.
    pub fn storage_width(&self) -> usize {
        self.storage.size_in_bytes()
    }

    pub fn is_mixed_precision(&self) -> bool {
        self.storage != self.reduction
    }

    /// Casts a tensor to the reduction dtype.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }

    /// Builds a storage-dtype tensor from an `f32` buffer.
    pub fn write_storage<S: Into<Shape>>(&self, data: Vec<f32>, shape: S, device: &Device) -> Result<Tensor> {
        let tensor = Tensor::from_vec(data, shape, device)?;
        self.cast_to_storage(&tensor)
    }

    /// Tolerance values derived from the configured dtypes.
    pub fn epsilons(&self) -> PrecisionEpsilons {
        PrecisionEpsilons {
            storage: epsilon_for(self.storage),
            reduction: epsilon_for(self.reduction),
        }
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

fn epsilon_for(dtype: DType) -> f32 {
    match dtype {
        DType::BF16 => 2e-2,
        DType::F16 => 5e-3,
        DType::F32 => 1e-5,
        DType::F64 => 1e-7,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_precision_storage_reduces_in_f32() {
        let policy = PrecisionPolicy::from_storage(DType::F16);
        assert_eq!(policy.storage(), DType::F16);
        assert_eq!(policy.reduction(), DType::F32);
        assert_eq!(policy.storage_width(), 2);
        assert!(policy.is_mixed_precision());
    }

    #[test]
    fn f32_buffers_round_trip_through_storage() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_storage(DType::BF16);
        let base = vec![0.125f32, -0.75, 3.5, 1.0];
        let stored = policy.write_storage(base.clone(), (2, 2), &device)?;
        assert_eq!(stored.dtype(), DType::BF16);
        assert_eq!(stored.dims(), &[2, 2]);

        let restored = stored.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        let eps = policy.epsilons().storage;
        for (orig, rest) in base.iter().zip(restored.iter()) {
            assert!((orig - rest).abs() <= eps);
        }
        Ok(())
    }

    #[test]
    fn epsilons_track_dtype_expectations() {
        let policy = PrecisionPolicy::from_storage(DType::F32);
        let eps = policy.epsilons();
        assert!(eps.storage < 1e-4);
        assert_eq!(eps.storage, eps.reduction);
    }
}
