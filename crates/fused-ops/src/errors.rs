//! Error types emitted by the fused pipelines.

use thiserror::Error;

/// Failure categories surfaced by configuration, resolution and kernels.
#[derive(Debug, Error)]
pub enum FusedError {
    /// The caller supplied a configuration the kernel library cannot execute.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// Only `gelu` and `relu` can be fused with dropout and bias.
    #[error("unsupported activation `{0}`: only gelu and relu can be fused with dropout")]
    UnsupportedActivation(String),
    /// Tensor extents disagree with the pipeline geometry.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the tensor dtype.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// The shared generator handle could not be accessed.
    #[error("generator state unavailable: {0}")]
    Generator(String),
    /// A configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// Opaque failure from the tensor runtime.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl FusedError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FusedError>;
