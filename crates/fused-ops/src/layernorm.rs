//! `layernorm(residual + dropout(src + bias))` and its backward.
//!
//! [`FusedDropoutLayerNormHelper`] composes a [`FusedDropoutHelper`] with a
//! [`LayerNormExt`]. The backward pass has two paths:
//!
//! * a single-pass row kernel, taken when `cols == 1024`, no bias gradient
//!   is requested, both normalisation parameter gradients are requested and the
//!   activation dtype is at most four bytes wide;
//! * the generic decomposition otherwise: normalisation backward, then the
//!   residual-dropout-bias backward on the resulting input gradient.
//!
//! Both paths compute the same gradients; [`FusedDropoutLayerNormHelper::generic_grad`]
//! is public so callers can cross-check them.

use candle_core::Tensor;
use layers::{LayerNorm, LayerNormGrads, LayerNormOutput, NormConfig, NormGradRequest, PrecisionPolicy};

use crate::dropout::DropoutParam;
use crate::errors::{FusedError, Result};
use crate::generator::OffsetGenerator;
use crate::geometry::{self, DeviceCapabilities};
use crate::helper::{FusedDropoutHelper, ResidualGradRequest};
use crate::kernels::{self, RowGradInputs};

/// Column count served by the single-pass backward kernel.
pub const FUSED_BACKWARD_COLS: usize = 1024;

/// Normalisation settings layered on top of the dropout helper.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerNormExt {
    pub epsilon: f32,
}

/// Closed set of pipeline variants.
#[derive(Debug, Clone)]
pub enum PipelineVariant {
    Plain(FusedDropoutHelper),
    WithLayerNorm(FusedDropoutLayerNormHelper),
}

impl PipelineVariant {
    /// The dropout pipeline shared by both variants.
    pub fn base(&self) -> &FusedDropoutHelper {
        match self {
            Self::Plain(helper) => helper,
            Self::WithLayerNorm(helper) => helper.base(),
        }
    }

    pub fn base_mut(&mut self) -> &mut FusedDropoutHelper {
        match self {
            Self::Plain(helper) => helper,
            Self::WithLayerNorm(helper) => helper.base_mut(),
        }
    }

    pub fn layer_norm(&self) -> Option<&FusedDropoutLayerNormHelper> {
        match self {
            Self::Plain(_) => None,
            Self::WithLayerNorm(helper) => Some(helper),
        }
    }

    pub fn layer_norm_mut(&mut self) -> Option<&mut FusedDropoutLayerNormHelper> {
        match self {
            Self::Plain(_) => None,
            Self::WithLayerNorm(helper) => Some(helper),
        }
    }
}

/// Forward results of [`FusedDropoutLayerNormHelper::layernorm_residual_dropout_bias`].
#[derive(Debug, Clone)]
pub struct LayerNormResidualOutput {
    /// `residual + dropout(src + bias)`, the normalisation input kept for backward.
    pub dropout_out: Tensor,
    pub mask: Tensor,
    pub out: Tensor,
    pub mean: Tensor,
    pub variance: Tensor,
}

/// Gradients the caller wants from the layer-norm composition backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerNormResidualGradRequest {
    /// Linear bias added before dropout.
    pub bias: bool,
    /// Layer-norm scale.
    pub scale: bool,
    /// Layer-norm shift.
    pub layernorm_bias: bool,
    pub residual: bool,
}

/// Which backward implementation produced a set of gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardPath {
    Fused1024,
    Generic,
}

#[derive(Debug, Clone)]
pub struct LayerNormResidualGrads {
    pub path: BackwardPath,
    /// Gradient w.r.t. the normalisation input.
    pub d_layernorm_src: Tensor,
    pub d_scale: Option<Tensor>,
    pub d_layernorm_bias: Option<Tensor>,
    pub d_dropout_src: Tensor,
    pub d_bias: Option<Tensor>,
    pub d_residual: Option<Tensor>,
}

/// Inputs shared by every layer-norm composition backward.
#[derive(Debug, Clone, Copy)]
pub struct LayerNormBackwardInputs<'a> {
    pub d_out: &'a Tensor,
    pub layernorm_src: &'a Tensor,
    pub mask: &'a Tensor,
    pub gamma: Option<&'a Tensor>,
    pub mean: &'a Tensor,
    pub variance: &'a Tensor,
}

#[derive(Debug, Clone)]
pub struct FusedDropoutLayerNormHelper {
    base: FusedDropoutHelper,
    norm: LayerNormExt,
}

impl FusedDropoutLayerNormHelper {
    pub fn new(
        rows: usize,
        cols: usize,
        dropout: DropoutParam,
        epsilon: f32,
        caps: DeviceCapabilities,
    ) -> Result<Self> {
        if !(epsilon.is_finite() && epsilon >= 0.0) {
            return Err(FusedError::configuration(format!(
                "layer norm epsilon must be finite and non-negative, got {epsilon}"
            )));
        }
        Ok(Self {
            base: FusedDropoutHelper::new(rows, cols, dropout, caps)?,
            norm: LayerNormExt { epsilon },
        })
    }

    /// A helper used only for its normalisation entry points.
    pub fn for_layer_norm(rows: usize, cols: usize, epsilon: f32) -> Result<Self> {
        Self::new(rows, cols, DropoutParam::default(), epsilon, DeviceCapabilities::default())
    }

    pub fn base(&self) -> &FusedDropoutHelper {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut FusedDropoutHelper {
        &mut self.base
    }

    pub fn epsilon(&self) -> f32 {
        self.norm.epsilon
    }

    fn norm_layer(&self, gamma: Option<&Tensor>, beta: Option<&Tensor>) -> Result<LayerNorm> {
        let config = NormConfig::new(self.base.cols()).with_epsilon(f64::from(self.norm.epsilon));
        LayerNorm::new(config, gamma.cloned(), beta.cloned())
            .map_err(|err| FusedError::shape(err.to_string()))
    }

    /// Plain layer normalisation with statistics.
    pub fn layer_norm(
        &self,
        src: &Tensor,
        gamma: Option<&Tensor>,
        beta: Option<&Tensor>,
    ) -> Result<LayerNormOutput> {
        self.base.check_activation("src", src)?;
        let policy = PrecisionPolicy::from_storage(src.dtype());
        Ok(self.norm_layer(gamma, beta)?.forward(src, &policy)?)
    }

    /// Backward of [`layer_norm`](Self::layer_norm).
    pub fn layer_norm_grad(
        &self,
        d_out: &Tensor,
        src: &Tensor,
        gamma: Option<&Tensor>,
        mean: &Tensor,
        variance: &Tensor,
        request: NormGradRequest,
    ) -> Result<LayerNormGrads> {
        self.base.check_activation("d_out", d_out)?;
        self.base.check_activation("src", src)?;
        self.base.check_same_dtype("src", src, "d_out", d_out)?;
        let policy = PrecisionPolicy::from_storage(d_out.dtype());
        let norm = self.norm_layer(gamma, None)?;
        norm.backward(src, d_out, mean, variance, request, &policy)
            .map_err(|err| FusedError::shape(err.to_string()))
    }

    /// `out = layernorm(residual + dropout(src + bias))`.
    pub fn layernorm_residual_dropout_bias<G>(
        &mut self,
        generator: &mut G,
        src: &Tensor,
        residual: &Tensor,
        bias: Option<&Tensor>,
        gamma: Option<&Tensor>,
        beta: Option<&Tensor>,
    ) -> Result<LayerNormResidualOutput>
    where
        G: OffsetGenerator + ?Sized,
    {
        self.base.check_residual_inputs(src, residual, bias)?;
        let norm = self.norm_layer(gamma, beta)?;

        let cols = self.base.cols();
        let vec_size = geometry::vector_width(src.dtype(), cols);
        let increment = geometry::layernorm_increment(cols, vec_size);
        self.base.resolve_with(generator, increment)?;

        let fused = self.base.launch_residual_dropout_bias(src, residual, bias)?;
        let policy = PrecisionPolicy::from_storage(src.dtype());
        let normalized = norm.forward(&fused.out, &policy)?;

        Ok(LayerNormResidualOutput {
            dropout_out: fused.out,
            mask: fused.mask,
            out: normalized.out,
            mean: normalized.mean,
            variance: normalized.variance,
        })
    }

    /// Whether the single-pass kernel serves this backward call.
    pub fn fused_backward_eligible(&self, d_out: &Tensor, request: LayerNormResidualGradRequest) -> bool {
        self.base.cols() == FUSED_BACKWARD_COLS
            && !request.bias
            && request.scale
            && request.layernorm_bias
            && d_out.dtype().size_in_bytes() <= 4
    }

    /// Backward of [`layernorm_residual_dropout_bias`](Self::layernorm_residual_dropout_bias).
    pub fn layernorm_residual_dropout_bias_grad(
        &self,
        inputs: LayerNormBackwardInputs<'_>,
        request: LayerNormResidualGradRequest,
    ) -> Result<LayerNormResidualGrads> {
        let fused = self.fused_backward_eligible(inputs.d_out, request);
        log::debug!("layernorm residual dropout backward: fused_1024={}", fused);
        if fused {
            self.fused_grad(inputs, request)
        } else {
            self.generic_grad(inputs, request)
        }
    }

    /// Normalisation backward followed by the residual-dropout-bias backward.
    pub fn generic_grad(
        &self,
        inputs: LayerNormBackwardInputs<'_>,
        request: LayerNormResidualGradRequest,
    ) -> Result<LayerNormResidualGrads> {
        let norm_grads = self.layer_norm_grad(
            inputs.d_out,
            inputs.layernorm_src,
            inputs.gamma,
            inputs.mean,
            inputs.variance,
            NormGradRequest {
                scale: request.scale,
                bias: request.layernorm_bias,
            },
        )?;
        let residual_grads = self.base.residual_dropout_bias_grad(
            &norm_grads.d_x,
            inputs.mask,
            ResidualGradRequest {
                bias: request.bias,
                residual: request.residual,
            },
        )?;

        Ok(LayerNormResidualGrads {
            path: BackwardPath::Generic,
            d_layernorm_src: norm_grads.d_x,
            d_scale: norm_grads.d_scale,
            d_layernorm_bias: norm_grads.d_bias,
            d_dropout_src: residual_grads.d_src,
            d_bias: residual_grads.d_bias,
            d_residual: residual_grads.d_residual,
        })
    }

    fn fused_grad(
        &self,
        inputs: LayerNormBackwardInputs<'_>,
        request: LayerNormResidualGradRequest,
    ) -> Result<LayerNormResidualGrads> {
        let rows = self.base.rows();
        let cols = self.base.cols();
        self.base.check_activation("d_out", inputs.d_out)?;
        self.base.check_activation("layernorm_src", inputs.layernorm_src)?;
        self.base
            .check_same_dtype("layernorm_src", inputs.layernorm_src, "d_out", inputs.d_out)?;
        self.base.check_mask(inputs.mask)?;
        let factor = self.base.checked_grad_factor()?;
        if let Some(gamma) = inputs.gamma {
            self.base.check_bias("gamma", gamma)?;
        }

        let d_out = kernels::read_f32(inputs.d_out)?;
        let layernorm_src = kernels::read_f32(inputs.layernorm_src)?;
        let mask = kernels::read_mask(inputs.mask)?;
        let gamma = inputs.gamma.map(kernels::read_f32).transpose()?;
        let mean = kernels::read_f32(inputs.mean)?;
        let variance = kernels::read_f32(inputs.variance)?;
        if mean.len() != rows || variance.len() != rows {
            return Err(FusedError::shape(format!(
                "layer norm statistics must have {rows} entries, got mean={} variance={}",
                mean.len(),
                variance.len()
            )));
        }

        let outputs = kernels::layernorm_residual_dropout_grad_rows(RowGradInputs {
            rows,
            cols,
            epsilon: self.norm.epsilon,
            factor,
            d_out: &d_out,
            layernorm_src: &layernorm_src,
            mask: &mask,
            gamma: gamma.as_deref(),
            mean: &mean,
            variance: &variance,
        });

        let policy = PrecisionPolicy::from_storage(inputs.d_out.dtype());
        let device = inputs.d_out.device();
        let dims = inputs.d_out.dims();
        let d_layernorm_src = kernels::to_storage(outputs.d_residual, dims, &policy, device)?;
        let d_dropout_src = kernels::to_storage(outputs.d_dropout_src, dims, &policy, device)?;
        let d_scale = Tensor::from_vec(outputs.d_scale, cols, device)?;
        let d_layernorm_bias = Tensor::from_vec(outputs.d_layernorm_bias, cols, device)?;

        Ok(LayerNormResidualGrads {
            path: BackwardPath::Fused1024,
            d_residual: request.residual.then(|| d_layernorm_src.clone()),
            d_layernorm_src,
            d_scale: Some(d_scale),
            d_layernorm_bias: Some(d_layernorm_bias),
            d_dropout_src,
            d_bias: None,
        })
    }
}
