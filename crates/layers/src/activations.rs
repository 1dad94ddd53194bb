//! Activations supported by the fused dropout-activation-bias kernels.
//!
//! The catalogue is closed: callers resolve an activation name once at
//! configuration time with [`ActivationKind::from_name`] and then carry the
//! tag (or the [`ActivationFns`] pair it resolves to) into the hot path.
//!
//! # Formulas
//!
//! * **GELU** uses the exact erf form `0.5 * x * (1 + erf(x / sqrt(2)))`, with
//!   derivative `Φ(x) + x φ(x)`.
//! * **ReLU** is `max(x, 0)` with derivative `[x > 0]`.
//!
//! Both forward and gradient functors expect `f32` (or `f64`) tensors; the
//! fused kernels promote before calling them.

use std::f64::consts::{PI, SQRT_2};
use std::fmt;

use candle_core::{Result, Tensor};

/// Identifies which non-linearity is applied between bias-add and dropout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    /// Erf-based GELU.
    Gelu,
    /// Rectified linear unit.
    Relu,
}

/// Forward/gradient functor pair resolved from an [`ActivationKind`].
#[derive(Clone, Copy)]
pub struct ActivationFns {
    pub forward: fn(&Tensor) -> Result<Tensor>,
    pub grad: fn(&Tensor) -> Result<Tensor>,
}

impl fmt::Debug for ActivationFns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationFns").finish_non_exhaustive()
    }
}

impl ActivationKind {
    /// Resolves a configuration name. Only `"gelu"` and `"relu"` exist.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "gelu" => Some(Self::Gelu),
            "relu" => Some(Self::Relu),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gelu => "gelu",
            Self::Relu => "relu",
        }
    }

    /// Returns the functor pair for this activation.
    pub fn functors(&self) -> ActivationFns {
        match self {
            Self::Gelu => ActivationFns {
                forward: gelu,
                grad: gelu_grad,
            },
            Self::Relu => ActivationFns {
                forward: relu,
                grad: relu_grad,
            },
        }
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        (self.functors().forward)(input)
    }

    /// Derivative of the activation evaluated at `input`.
    pub fn grad(&self, input: &Tensor) -> Result<Tensor> {
        (self.functors().grad)(input)
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn gelu(input: &Tensor) -> Result<Tensor> {
    input.gelu_erf()
}

fn gelu_grad(input: &Tensor) -> Result<Tensor> {
    // cdf = 0.5 * (1 + erf(x / sqrt(2)))
    let cdf = input.affine(1.0 / SQRT_2, 0.0)?.erf()?.affine(0.5, 0.5)?;
    // pdf = exp(-x^2 / 2) / sqrt(2 pi)
    let pdf = input
        .sqr()?
        .affine(-0.5, 0.0)?
        .exp()?
        .affine(1.0 / (2.0 * PI).sqrt(), 0.0)?;
    cdf.add(&input.mul(&pdf)?)
}

fn relu(input: &Tensor) -> Result<Tensor> {
    input.relu()
}

fn relu_grad(input: &Tensor) -> Result<Tensor> {
    input.gt(&input.zeros_like()?)?.to_dtype(input.dtype())
}
