//! Backward of the singular value decomposition `X = U diag(S) Vh`.
//!
//! The gradient is composed from tensor primitives only. With `k`
//! singular values and `F[i][j] = 1 / (s_j^2 - s_i^2)` (zero on the
//! diagonal):
//!
//! ```text
//! dX = U diag(dS) Vh
//!    + U ((F * (U^T dU - dU^T U)) diag(S)) Vh + (I - U U^T) dU diag(1/S) Vh   (m > k)
//!    + U (diag(S) (F * (Vh dVh^T - dVh Vh^T))) Vh + U diag(1/S) dVh (I - Vh^T Vh)   (n > k)
//! ```
//!
//! Leading batch dimensions are carried through unchanged.

use candle_core::{DType, Device, Tensor};

use crate::errors::{FusedError, Result};

/// Outputs of the forward decomposition.
#[derive(Debug, Clone, Copy)]
pub struct SvdFactors<'a> {
    /// `(.., m, k)`, or `(.., m, m)` with `full_matrices`.
    pub u: &'a Tensor,
    /// `(.., k)`.
    pub s: &'a Tensor,
    /// `(.., k, n)`, or `(.., n, n)` with `full_matrices`.
    pub vh: &'a Tensor,
}

/// Upstream gradients. A missing gradient contributes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SvdUpstream<'a> {
    pub u: Option<&'a Tensor>,
    pub s: Option<&'a Tensor>,
    pub vh: Option<&'a Tensor>,
}

/// Gradient w.r.t. the decomposed matrix, with dims `x_dims`.
pub fn svd_grad(
    x_dims: &[usize],
    factors: SvdFactors<'_>,
    upstream: SvdUpstream<'_>,
    full_matrices: bool,
) -> Result<Tensor> {
    let rank = x_dims.len();
    if rank < 2 {
        return Err(FusedError::shape(format!(
            "svd input must be at least 2-D, got {x_dims:?}"
        )));
    }
    let (m, n) = (x_dims[rank - 2], x_dims[rank - 1]);
    let s_rank = factors.s.rank();
    if s_rank != rank - 1 {
        return Err(FusedError::shape(format!(
            "singular values must have rank {}, got {:?}",
            rank - 1,
            factors.s.dims()
        )));
    }
    let k = factors.s.dims()[s_rank - 1];
    if k > m.min(n) {
        return Err(FusedError::shape(format!(
            "{k} singular values for a {m}x{n} matrix"
        )));
    }

    let (u, vh, d_u, d_vh) = if full_matrices {
        (
            factors.u.narrow(rank - 1, 0, k)?,
            factors.vh.narrow(rank - 2, 0, k)?,
            upstream.u.map(|g| g.narrow(rank - 1, 0, k)).transpose()?,
            upstream.vh.map(|g| g.narrow(rank - 2, 0, k)).transpose()?,
        )
    } else {
        (
            factors.u.clone(),
            factors.vh.clone(),
            upstream.u.cloned(),
            upstream.vh.cloned(),
        )
    };
    let s = factors.s;
    let dtype = s.dtype();
    let device = s.device();

    // (.., 1, k) scales columns, (.., k, 1) scales rows.
    let s_cols = s.unsqueeze(s_rank - 1)?;
    let s_rows = s.unsqueeze(s_rank)?;
    let s_inv = s.recip()?;
    let s_sq = s.sqr()?;
    let f = s_sq
        .unsqueeze(s_rank - 1)?
        .broadcast_sub(&s_sq.unsqueeze(s_rank)?)?
        .broadcast_add(&diagonal_infinity(k, dtype, device)?)?
        .recip()?;

    let mut d_x = Tensor::zeros(x_dims, dtype, device)?;

    if let Some(d_s) = upstream.s {
        let sigma_term = matmul(&u.broadcast_mul(&d_s.unsqueeze(s_rank - 1)?)?, &vh)?;
        d_x = d_x.add(&sigma_term)?;
    }

    if let Some(d_u) = &d_u {
        let utg = matmul(&u.t()?, d_u)?;
        let gtu = matmul(&d_u.t()?, &u)?;
        let inner = utg.sub(&gtu)?.mul(&f)?.broadcast_mul(&s_cols)?;
        let mut u_term = matmul(&u, &inner)?;
        if m > k {
            let project = identity(m, dtype, device)?.broadcast_sub(&matmul(&u, &u.t()?)?)?;
            let complement = matmul(&project, d_u)?.broadcast_mul(&s_inv.unsqueeze(s_rank - 1)?)?;
            u_term = u_term.add(&complement)?;
        }
        d_x = d_x.add(&matmul(&u_term, &vh)?)?;
    }

    if let Some(d_vh) = &d_vh {
        let vtg = matmul(&vh, &d_vh.t()?)?;
        let gtv = matmul(d_vh, &vh.t()?)?;
        let mut v_term = matmul(&vtg.sub(&gtv)?.mul(&f)?, &vh)?.broadcast_mul(&s_rows)?;
        if n > k {
            let project = identity(n, dtype, device)?.broadcast_sub(&matmul(&vh.t()?, &vh)?)?;
            let complement = matmul(d_vh, &project)?.broadcast_mul(&s_inv.unsqueeze(s_rank)?)?;
            v_term = v_term.add(&complement)?;
        }
        d_x = d_x.add(&matmul(&u, &v_term)?)?;
    }

    Ok(d_x)
}

fn matmul(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    Ok(lhs.contiguous()?.matmul(&rhs.contiguous()?)?)
}

fn identity(size: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    scaled_diagonal(size, 1.0, dtype, device)
}

/// `diag(inf)`. Built directly so off-diagonal entries stay exactly zero.
fn diagonal_infinity(size: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    scaled_diagonal(size, f64::INFINITY, dtype, device)
}

fn scaled_diagonal(size: usize, value: f64, dtype: DType, device: &Device) -> Result<Tensor> {
    let data = (0..size * size)
        .map(|idx| if idx / size == idx % size { value } else { 0.0 })
        .collect::<Vec<_>>();
    Ok(Tensor::from_vec(data, (size, size), device)?.to_dtype(dtype)?)
}
