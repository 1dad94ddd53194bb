//! Fused dropout, bias, residual and layer-norm pipelines with their
//! gradients, plus the SVD gradient composition.

pub mod config;
pub mod dropout;
pub mod errors;
pub mod generator;
pub mod geometry;
pub mod helper;
pub mod kernels;
pub mod layernorm;
pub mod svd_grad;

pub use config::{DropoutConfig, PipelineConfig};
pub use dropout::{DropoutImplementation, DropoutParam};
pub use errors::{FusedError, Result};
pub use generator::{Generator, GeneratorState, OffsetGenerator, SeedOffset};
pub use geometry::{DeviceCapabilities, LaunchConfig};
pub use helper::{
    resolve_activation, ActBiasGradRequest, DropoutActBiasGrads, DropoutOutput, FusedDropoutHelper,
    ResidualDropoutBiasGrads, ResidualGradRequest,
};
pub use layernorm::{
    BackwardPath, FusedDropoutLayerNormHelper, LayerNormBackwardInputs, LayerNormExt, LayerNormResidualGradRequest,
    LayerNormResidualGrads, LayerNormResidualOutput, PipelineVariant, FUSED_BACKWARD_COLS,
};
pub use svd_grad::{svd_grad, SvdFactors, SvdUpstream};
