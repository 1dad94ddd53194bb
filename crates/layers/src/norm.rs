//! Layer normalisation with explicit statistics and a backward pass.
//!
//! Inputs are viewed as `(rows, hidden)` matrices: any leading layout is
//! accepted as long as the last axis equals `hidden_size`, and outputs keep
//! the original dims. Statistics (per-row mean and biased variance) and the
//! affine parameters live in [`PrecisionPolicy::reduction`]; the normalised
//! output and the input gradient are cast back to the activation dtype.

use candle_core::{Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for a layer normalisation over the last axis.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// Forward results: the normalised output and the statistics backward needs.
#[derive(Debug, Clone)]
pub struct LayerNormOutput {
    pub out: Tensor,
    /// Per-row mean, shape `(rows,)`.
    pub mean: Tensor,
    /// Per-row biased variance, shape `(rows,)`.
    pub variance: Tensor,
}

/// Which parameter gradients the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NormGradRequest {
    pub scale: bool,
    pub bias: bool,
}

#[derive(Debug, Clone)]
pub struct LayerNormGrads {
    /// Gradient w.r.t. the normalised input, same dims and dtype as the input.
    pub d_x: Tensor,
    /// Gradient w.r.t. the scale, shape `(hidden,)` in the reduction dtype.
    pub d_scale: Option<Tensor>,
    /// Gradient w.r.t. the shift, shape `(hidden,)` in the reduction dtype.
    pub d_bias: Option<Tensor>,
}

/// LayerNorm with optional scale (`gamma`) and shift (`beta`).
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl LayerNorm {
    pub fn new(config: NormConfig, weight: Option<Tensor>, bias: Option<Tensor>) -> Result<Self> {
        if config.hidden_size == 0 {
            return Err(Error::Msg("layer norm hidden size must be non-zero".into()));
        }
        if let Some(weight) = &weight {
            checks::expect_shape("norm.weight", weight, &[config.hidden_size])?;
        }
        if let Some(bias) = &bias {
            checks::expect_shape("norm.bias", bias, &[config.hidden_size])?;
        }
        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    fn rows_of(&self, name: &str, tensor: &Tensor) -> Result<usize> {
        let hidden = self.config.hidden_size;
        let rows = tensor.elem_count() / hidden;
        checks::expect_rows_cols(name, tensor, rows, hidden)?;
        Ok(rows)
    }

    /// Normalises `hidden` and returns the statistics alongside the output.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<LayerNormOutput> {
        let rows = self.rows_of("norm.input", hidden)?;
        let cols = self.config.hidden_size;

        let x = policy.cast_for_reduction(hidden)?.reshape((rows, cols))?;
        let mean = x.mean_keepdim(1)?;
        let centered = x.broadcast_sub(&mean)?;
        let variance = centered.sqr()?.mean_keepdim(1)?;
        let rstd = (&variance + self.config.epsilon)?.sqrt()?.recip()?;
        let mut normalized = centered.broadcast_mul(&rstd)?;

        if let Some(weight) = &self.weight {
            let weight = policy.cast_for_reduction(weight)?;
            normalized = normalized.broadcast_mul(&weight)?;
        }
        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_reduction(bias)?;
            normalized = normalized.broadcast_add(&bias)?;
        }

        let out = policy
            .cast_to_storage(&normalized)?
            .reshape(hidden.dims())?;
        Ok(LayerNormOutput {
            out,
            mean: mean.squeeze(1)?,
            variance: variance.squeeze(1)?,
        })
    }

    /// Backward pass through the normalisation given the forward statistics.
    pub fn backward(
        &self,
        hidden: &Tensor,
        d_out: &Tensor,
        mean: &Tensor,
        variance: &Tensor,
        request: NormGradRequest,
        policy: &PrecisionPolicy,
    ) -> Result<LayerNormGrads> {
        let rows = self.rows_of("norm.input", hidden)?;
        let cols = self.config.hidden_size;
        checks::expect_rows_cols("norm.d_out", d_out, rows, cols)?;
        checks::expect_shape("norm.mean", mean, &[rows])?;
        checks::expect_shape("norm.variance", variance, &[rows])?;

        let x = policy.cast_for_reduction(hidden)?.reshape((rows, cols))?;
        let dy = policy.cast_for_reduction(d_out)?.reshape((rows, cols))?;
        let mean = policy.cast_for_reduction(mean)?.reshape((rows, 1))?;
        let variance = policy.cast_for_reduction(variance)?.reshape((rows, 1))?;

        let rstd = (variance + self.config.epsilon)?.sqrt()?.recip()?;
        let x_hat = x.broadcast_sub(&mean)?.broadcast_mul(&rstd)?;

        let g = match &self.weight {
            Some(weight) => dy.broadcast_mul(&policy.cast_for_reduction(weight)?)?,
            None => dy.clone(),
        };
        let mean_g = g.mean_keepdim(1)?;
        let mean_g_xhat = g.mul(&x_hat)?.mean_keepdim(1)?;
        let d_x = g
            .broadcast_sub(&mean_g)?
            .sub(&x_hat.broadcast_mul(&mean_g_xhat)?)?
            .broadcast_mul(&rstd)?;

        let d_scale = if request.scale {
            Some(dy.mul(&x_hat)?.sum(0)?)
        } else {
            None
        };
        let d_bias = if request.bias {
            Some(dy.sum(0)?)
        } else {
            None
        };

        Ok(LayerNormGrads {
            d_x: policy.cast_to_storage(&d_x)?.reshape(hidden.dims())?,
            d_scale,
            d_bias,
        })
    }
}
