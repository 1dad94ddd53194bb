//! Building blocks shared by the fused dropout pipelines.
//!
//! The crate hosts the shape/dtype checks, the precision policy used around
//! every kernel, the closed activation catalogue, and layer normalisation with
//! explicit statistics.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod norm;

pub use activations::{ActivationFns, ActivationKind};
pub use dtypes::PrecisionPolicy;
pub use norm::{LayerNorm, LayerNormGrads, LayerNormOutput, NormConfig, NormGradRequest};
