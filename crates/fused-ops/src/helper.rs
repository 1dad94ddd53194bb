//! Fused dropout + bias (+ activation) + residual pipelines.
//!
//! A [`FusedDropoutHelper`] is bound to one `(rows, cols)` geometry and one
//! [`DropoutParam`]. Forward calls resolve a fresh seed/increment, sample the
//! keep-mask and return it with the output; backward calls consume that mask
//! unchanged and never touch the generator.
//!
//! Tensors may carry any leading layout as long as the last axis is `cols`
//! and the element count is `rows * cols`. Outputs keep the dims of `src`.

use candle_core::{DType, Tensor};
use layers::{checks, ActivationKind, PrecisionPolicy};

use crate::dropout::DropoutParam;
use crate::errors::{FusedError, Result};
use crate::generator::OffsetGenerator;
use crate::geometry::{self, DeviceCapabilities};
use crate::kernels;

/// Output of a fused forward call.
#[derive(Debug, Clone)]
pub struct DropoutOutput {
    pub out: Tensor,
    /// `u8` keep-mask with the dims of `src`; 1 means the element survived.
    pub mask: Tensor,
}

/// Gradients the caller wants from a residual-dropout-bias backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResidualGradRequest {
    pub bias: bool,
    pub residual: bool,
}

impl Default for ResidualGradRequest {
    fn default() -> Self {
        Self {
            bias: true,
            residual: true,
        }
    }
}

/// Gradients the caller wants from a dropout-act-bias backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActBiasGradRequest {
    pub bias: bool,
}

impl Default for ActBiasGradRequest {
    fn default() -> Self {
        Self { bias: true }
    }
}

#[derive(Debug, Clone)]
pub struct ResidualDropoutBiasGrads {
    pub d_src: Tensor,
    pub d_bias: Option<Tensor>,
    pub d_residual: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct DropoutActBiasGrads {
    pub d_src: Tensor,
    pub d_bias: Option<Tensor>,
}

/// Orchestrates the fused dropout kernels for a fixed geometry.
#[derive(Debug, Clone)]
pub struct FusedDropoutHelper {
    rows: usize,
    cols: usize,
    dropout: DropoutParam,
    caps: DeviceCapabilities,
}

impl FusedDropoutHelper {
    pub fn new(rows: usize, cols: usize, dropout: DropoutParam, caps: DeviceCapabilities) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(FusedError::shape(format!(
                "pipeline geometry must be non-empty, got {rows}x{cols}"
            )));
        }
        if caps.max_threads_per_block == 0 {
            return Err(FusedError::configuration(
                "max_threads_per_block must be greater than 0",
            ));
        }
        dropout.validate()?;
        log::info!(
            "fused dropout helper: rows={} cols={} p={} upscale={} is_test={}",
            rows,
            cols,
            dropout.probability,
            dropout.is_upscale_in_train(),
            dropout.is_test
        );
        Ok(Self {
            rows,
            cols,
            dropout,
            caps,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn dropout(&self) -> &DropoutParam {
        &self.dropout
    }

    /// Mutable access to the dropout settings. They are re-validated on every
    /// forward and backward call.
    pub fn dropout_mut(&mut self) -> &mut DropoutParam {
        &mut self.dropout
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.caps
    }

    fn resolve_increment<G>(&mut self, generator: &mut G, dtype: DType) -> Result<u64>
    where
        G: OffsetGenerator + ?Sized,
    {
        let vec_size = geometry::vector_width(dtype, self.cols);
        let increment = geometry::residual_increment(&self.caps, self.rows, self.cols, vec_size);
        self.resolve_with(generator, increment)
    }

    /// Advances the seed state with an increment computed by a caller that
    /// uses its own launch geometry.
    pub(crate) fn resolve_with<G>(&mut self, generator: &mut G, increment: u64) -> Result<u64>
    where
        G: OffsetGenerator + ?Sized,
    {
        self.dropout.validate()?;
        self.dropout.update_seed_and_increment(generator, increment)
    }

    /// Backward scale for kept elements, after re-checking the probability.
    pub(crate) fn checked_grad_factor(&self) -> Result<f32> {
        self.dropout.validate()?;
        Ok(self.dropout.grad_factor())
    }

    pub(crate) fn check_activation(&self, name: &str, tensor: &Tensor) -> Result<()> {
        checks::expect_rows_cols(name, tensor, self.rows, self.cols)
            .map_err(|err| FusedError::shape(err.to_string()))?;
        checks::expect_dtype_in(name, tensor, checks::KERNEL_DTYPES).map_err(|_| {
            FusedError::UnsupportedDType {
                requested: format!("{:?} for {name}", tensor.dtype()),
            }
        })
    }

    /// Requires `tensor` to share the storage dtype of `reference`.
    pub(crate) fn check_same_dtype(
        &self,
        name: &str,
        tensor: &Tensor,
        reference_name: &str,
        reference: &Tensor,
    ) -> Result<()> {
        checks::expect_same_dtype(name, tensor, reference_name, reference)
            .map_err(|err| FusedError::UnsupportedDType {
                requested: err.to_string(),
            })
    }

    pub(crate) fn check_bias(&self, name: &str, bias: &Tensor) -> Result<()> {
        checks::expect_shape(name, bias, &[self.cols]).map_err(|err| FusedError::shape(err.to_string()))
    }

    pub(crate) fn check_mask(&self, mask: &Tensor) -> Result<()> {
        if mask.dtype() != DType::U8 {
            return Err(FusedError::UnsupportedDType {
                requested: format!("{:?} for mask (expected U8)", mask.dtype()),
            });
        }
        checks::expect_rows_cols("mask", mask, self.rows, self.cols)
            .map_err(|err| FusedError::shape(err.to_string()))
    }

    /// Geometry and dtype checks shared by the residual forward pipelines.
    pub(crate) fn check_residual_inputs(&self, src: &Tensor, residual: &Tensor, bias: Option<&Tensor>) -> Result<()> {
        self.check_activation("src", src)?;
        self.check_activation("residual", residual)?;
        self.check_same_dtype("residual", residual, "src", src)?;
        if let Some(bias) = bias {
            self.check_bias("bias", bias)?;
            self.check_same_dtype("bias", bias, "src", src)?;
        }
        Ok(())
    }

    /// Forward kernel once the seed is resolved: `residual + dropout(src + bias)`.
    pub(crate) fn launch_residual_dropout_bias(
        &self,
        src: &Tensor,
        residual: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<DropoutOutput> {
        let policy = PrecisionPolicy::from_storage(src.dtype());
        let shape = (self.rows, self.cols);
        let mask = kernels::sample_mask(&self.dropout, self.rows, self.cols, src.device())?;

        let branch = kernels::bias_add(&src.reshape(shape)?, bias)?;
        let dropped = branch.mul(&kernels::scaled_mask(&mask, self.dropout.forward_factor())?)?;
        let out = residual.reshape(shape)?.to_dtype(DType::F32)?.add(&dropped)?;

        Ok(DropoutOutput {
            out: policy.cast_to_storage(&out)?.reshape(src.dims())?,
            mask: mask.reshape(src.dims())?,
        })
    }

    /// `out = residual + dropout(src + bias)`.
    pub fn residual_dropout_bias<G>(
        &mut self,
        generator: &mut G,
        src: &Tensor,
        residual: &Tensor,
        bias: Option<&Tensor>,
    ) -> Result<DropoutOutput>
    where
        G: OffsetGenerator + ?Sized,
    {
        self.check_residual_inputs(src, residual, bias)?;
        self.resolve_increment(generator, src.dtype())?;
        self.launch_residual_dropout_bias(src, residual, bias)
    }

    /// Backward of [`residual_dropout_bias`](Self::residual_dropout_bias).
    ///
    /// `d_src = d_out * mask * factor`, `d_bias` sums `d_src` over rows, and
    /// `d_residual` is a copy of `d_out`.
    pub fn residual_dropout_bias_grad(
        &self,
        d_out: &Tensor,
        mask: &Tensor,
        request: ResidualGradRequest,
    ) -> Result<ResidualDropoutBiasGrads> {
        self.check_activation("d_out", d_out)?;
        self.check_mask(mask)?;
        let policy = PrecisionPolicy::from_storage(d_out.dtype());
        let shape = (self.rows, self.cols);

        let multiplier = kernels::scaled_mask(&mask.reshape(shape)?, self.checked_grad_factor()?)?;
        let d_src = d_out.reshape(shape)?.to_dtype(DType::F32)?.mul(&multiplier)?;
        let d_bias = if request.bias {
            Some(policy.cast_to_storage(&d_src.sum(0)?)?)
        } else {
            None
        };
        let d_residual = if request.residual {
            Some(d_out.copy()?)
        } else {
            None
        };

        Ok(ResidualDropoutBiasGrads {
            d_src: policy.cast_to_storage(&d_src)?.reshape(d_out.dims())?,
            d_bias,
            d_residual,
        })
    }

    /// `out = dropout(activation(src + bias))`.
    pub fn dropout_act_bias<G>(
        &mut self,
        generator: &mut G,
        src: &Tensor,
        bias: Option<&Tensor>,
        activation: ActivationKind,
    ) -> Result<DropoutOutput>
    where
        G: OffsetGenerator + ?Sized,
    {
        self.check_activation("src", src)?;
        if let Some(bias) = bias {
            self.check_bias("bias", bias)?;
            self.check_same_dtype("bias", bias, "src", src)?;
        }
        self.resolve_increment(generator, src.dtype())?;

        let policy = PrecisionPolicy::from_storage(src.dtype());
        let shape = (self.rows, self.cols);
        let mask = kernels::sample_mask(&self.dropout, self.rows, self.cols, src.device())?;

        let activated = activation.forward(&kernels::bias_add(&src.reshape(shape)?, bias)?)?;
        let out = activated.mul(&kernels::scaled_mask(&mask, self.dropout.forward_factor())?)?;

        Ok(DropoutOutput {
            out: policy.cast_to_storage(&out)?.reshape(src.dims())?,
            mask: mask.reshape(src.dims())?,
        })
    }

    /// Name-keyed variant of [`dropout_act_bias`](Self::dropout_act_bias).
    /// Names other than `gelu` and `relu` are a fatal configuration error.
    pub fn dropout_act_bias_by_name<G>(
        &mut self,
        generator: &mut G,
        src: &Tensor,
        bias: Option<&Tensor>,
        activation: &str,
    ) -> Result<DropoutOutput>
    where
        G: OffsetGenerator + ?Sized,
    {
        let activation = resolve_activation(activation)?;
        self.dropout_act_bias(generator, src, bias, activation)
    }

    /// Backward of [`dropout_act_bias`](Self::dropout_act_bias). `src` and
    /// `bias` are the forward inputs; the activation gradient is evaluated at
    /// `src + bias`.
    pub fn dropout_act_bias_grad(
        &self,
        d_out: &Tensor,
        src: &Tensor,
        bias: Option<&Tensor>,
        mask: &Tensor,
        activation: ActivationKind,
        request: ActBiasGradRequest,
    ) -> Result<DropoutActBiasGrads> {
        self.check_activation("d_out", d_out)?;
        self.check_activation("src", src)?;
        self.check_same_dtype("src", src, "d_out", d_out)?;
        if let Some(bias) = bias {
            self.check_bias("bias", bias)?;
            self.check_same_dtype("bias", bias, "d_out", d_out)?;
        }
        self.check_mask(mask)?;
        let policy = PrecisionPolicy::from_storage(d_out.dtype());
        let shape = (self.rows, self.cols);

        let multiplier = kernels::scaled_mask(&mask.reshape(shape)?, self.checked_grad_factor()?)?;
        let act_grad = activation.grad(&kernels::bias_add(&src.reshape(shape)?, bias)?)?;
        let d_src = d_out
            .reshape(shape)?
            .to_dtype(DType::F32)?
            .mul(&multiplier)?
            .mul(&act_grad)?;
        let d_bias = if request.bias {
            Some(policy.cast_to_storage(&d_src.sum(0)?)?)
        } else {
            None
        };

        Ok(DropoutActBiasGrads {
            d_src: policy.cast_to_storage(&d_src)?.reshape(d_out.dims())?,
            d_bias,
        })
    }

    /// Name-keyed variant of [`dropout_act_bias_grad`](Self::dropout_act_bias_grad).
    pub fn dropout_act_bias_grad_by_name(
        &self,
        d_out: &Tensor,
        src: &Tensor,
        bias: Option<&Tensor>,
        mask: &Tensor,
        activation: &str,
        request: ActBiasGradRequest,
    ) -> Result<DropoutActBiasGrads> {
        let activation = resolve_activation(activation)?;
        self.dropout_act_bias_grad(d_out, src, bias, mask, activation, request)
    }
}

/// Resolves an activation name, rejecting anything outside the catalogue.
pub fn resolve_activation(name: &str) -> Result<ActivationKind> {
    ActivationKind::from_name(name).ok_or_else(|| FusedError::UnsupportedActivation(name.to_string()))
}
