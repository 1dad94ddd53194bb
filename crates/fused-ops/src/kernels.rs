//! CPU kernels behind the fused pipelines.
//!
//! Elementwise stages are expressed with candle tensor ops in `f32`. The mask
//! sampler and the single-pass layer-norm/dropout backward are hand-written
//! row loops over flat buffers.

use candle_core::{DType, Device, Tensor};
use layers::PrecisionPolicy;

use crate::dropout::DropoutParam;
use crate::errors::Result;
use crate::generator::uniform;

/// Samples the keep-mask for a `(rows, cols)` launch as a `u8` tensor.
///
/// Element `i` survives when its uniform draw is at least the dropout
/// probability. Test mode and `p == 0` produce an all-pass mask without
/// touching the stream.
pub fn sample_mask(param: &DropoutParam, rows: usize, cols: usize, device: &Device) -> Result<Tensor> {
    let elems = rows * cols;
    if !param.samples_mask() {
        return Ok(Tensor::ones((rows, cols), DType::U8, device)?);
    }
    let seed = param.seed();
    let offset = param.increment();
    let probability = param.probability;
    let data = (0..elems as u64)
        .map(|index| u8::from(uniform(seed, offset, index) >= probability))
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(data, (rows, cols), device)?)
}

/// Mask converted into an `f32` multiplier already carrying `factor`.
pub fn scaled_mask(mask: &Tensor, factor: f32) -> Result<Tensor> {
    Ok(mask.to_dtype(DType::F32)?.affine(f64::from(factor), 0.0)?)
}

/// `src + bias` in `f32`, broadcasting the bias over rows.
pub fn bias_add(src: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
    let src = src.to_dtype(DType::F32)?;
    Ok(match bias {
        Some(bias) => src.broadcast_add(&bias.to_dtype(DType::F32)?)?,
        None => src,
    })
}

/// Inputs to [`layernorm_residual_dropout_grad_rows`].
pub struct RowGradInputs<'a> {
    pub rows: usize,
    pub cols: usize,
    pub epsilon: f32,
    pub factor: f32,
    pub d_out: &'a [f32],
    pub layernorm_src: &'a [f32],
    pub mask: &'a [u8],
    pub gamma: Option<&'a [f32]>,
    pub mean: &'a [f32],
    pub variance: &'a [f32],
}

/// Buffers produced by [`layernorm_residual_dropout_grad_rows`].
pub struct RowGradOutputs {
    pub d_scale: Vec<f32>,
    pub d_layernorm_bias: Vec<f32>,
    /// Gradient reaching the residual branch (equal to the layer-norm input
    /// gradient).
    pub d_residual: Vec<f32>,
    pub d_dropout_src: Vec<f32>,
}

/// Single pass over each row producing every gradient of
/// `layernorm(residual + dropout(src))` at once.
pub fn layernorm_residual_dropout_grad_rows(inputs: RowGradInputs<'_>) -> RowGradOutputs {
    let RowGradInputs {
        rows,
        cols,
        epsilon,
        factor,
        d_out,
        layernorm_src,
        mask,
        gamma,
        mean,
        variance,
    } = inputs;

    let mut d_scale = vec![0f32; cols];
    let mut d_layernorm_bias = vec![0f32; cols];
    let mut d_residual = vec![0f32; rows * cols];
    let mut d_dropout_src = vec![0f32; rows * cols];
    let inv_cols = 1.0 / cols as f32;

    for row in 0..rows {
        let start = row * cols;
        let rstd = 1.0 / (variance[row] + epsilon).sqrt();
        let row_mean = mean[row];

        let mut sum_g = 0f32;
        let mut sum_g_xhat = 0f32;
        for col in 0..cols {
            let dy = d_out[start + col];
            let x_hat = (layernorm_src[start + col] - row_mean) * rstd;
            let g = dy * gamma.map_or(1.0, |gamma| gamma[col]);
            sum_g += g;
            sum_g_xhat += g * x_hat;
            d_scale[col] += dy * x_hat;
            d_layernorm_bias[col] += dy;
        }

        let mean_g = sum_g * inv_cols;
        let mean_g_xhat = sum_g_xhat * inv_cols;
        for col in 0..cols {
            let idx = start + col;
            let x_hat = (layernorm_src[idx] - row_mean) * rstd;
            let g = d_out[idx] * gamma.map_or(1.0, |gamma| gamma[col]);
            let dx = rstd * (g - mean_g - x_hat * mean_g_xhat);
            d_residual[idx] = dx;
            d_dropout_src[idx] = dx * f32::from(mask[idx]) * factor;
        }
    }

    RowGradOutputs {
        d_scale,
        d_layernorm_bias,
        d_residual,
        d_dropout_src,
    }
}

/// Reads a tensor as `f32` regardless of its dtype.
pub fn read_f32(tensor: &Tensor) -> Result<Vec<f32>> {
    Ok(tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

pub fn read_mask(mask: &Tensor) -> Result<Vec<u8>> {
    Ok(mask.flatten_all()?.to_dtype(DType::U8)?.to_vec1::<u8>()?)
}

/// Casts an `f32` result back to the activation storage dtype with `dims`.
pub fn to_storage(data: Vec<f32>, dims: &[usize], policy: &PrecisionPolicy, device: &Device) -> Result<Tensor> {
    Ok(policy.write_storage(data, dims, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dropout::DropoutImplementation;
    use crate::generator::GeneratorState;

    #[test]
    fn mask_keep_rate_tracks_probability() -> Result<()> {
        let mut param = DropoutParam::new(0.3, DropoutImplementation::UpscaleInTrain, false);
        let mut state = GeneratorState::new(2024);
        param.update_seed_and_increment(&mut state, 4)?;
        let mask = sample_mask(&param, 100, 100, &Device::Cpu)?;
        let kept = read_mask(&mask)?.iter().map(|&m| m as usize).sum::<usize>();
        let rate = kept as f32 / 10_000.0;
        assert!((rate - 0.7).abs() < 0.03, "keep rate {rate}");
        Ok(())
    }

    #[test]
    fn test_mode_mask_is_all_pass() -> Result<()> {
        let param = DropoutParam::new(0.9, DropoutImplementation::UpscaleInTrain, true);
        let mask = sample_mask(&param, 3, 5, &Device::Cpu)?;
        assert!(read_mask(&mask)?.iter().all(|&m| m == 1));
        Ok(())
    }

    #[test]
    fn row_kernel_without_affine_annihilates_constant_gradient() {
        let (rows, cols) = (2, 4);
        let src = [1.0f32, 2.0, 3.0, 4.0, -1.0, 0.0, 1.0, 2.0];
        let d_out = [1.0f32; 8];
        let mask = [1u8; 8];
        let outputs = layernorm_residual_dropout_grad_rows(RowGradInputs {
            rows,
            cols,
            epsilon: 1e-5,
            factor: 1.0,
            d_out: &d_out,
            layernorm_src: &src,
            mask: &mask,
            gamma: None,
            mean: &[2.5, 0.5],
            variance: &[1.25, 1.25],
        });
        assert!(outputs.d_residual.iter().all(|v| v.abs() < 1e-5));
        assert_eq!(outputs.d_layernorm_bias, vec![2.0; 4]);
        assert_eq!(outputs.d_dropout_src.len(), rows * cols);
    }
}
