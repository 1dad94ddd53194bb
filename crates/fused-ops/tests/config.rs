use std::fs;

use candle_core::{DType, Device, Tensor};
use fused_ops::{DropoutImplementation, FusedError, PipelineConfig, PipelineVariant, Result};
use tempfile::tempdir;

#[test]
fn toml_file_builds_a_layer_norm_pipeline() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("pipeline.toml");
    fs::write(
        &path,
        r#"
rows = 2
cols = 1024
epsilon = 1e-6
layer_norm = true
generator_seed = 11

[dropout]
rate = 0.1
implementation = "upscale_in_train"
"#,
    )?;

    let config = PipelineConfig::from_path(&path)?;
    assert_eq!(config.dropout.implementation, DropoutImplementation::UpscaleInTrain);
    let mut variant = config.build()?;
    let mut state = config.generator_state();
    let helper = variant.layer_norm_mut().expect("layer norm variant");

    let src = Tensor::ones((2, 1024), DType::F32, &Device::Cpu)?;
    let output = helper.layernorm_residual_dropout_bias(&mut state, &src, &src, None, None, None)?;
    assert_eq!(output.out.dims(), &[2, 1024]);
    assert_eq!(state.current().seed, 11);
    Ok(())
}

#[test]
fn json_file_is_accepted_and_unknown_extensions_are_not() -> Result<()> {
    let dir = tempdir()?;
    let json = dir.path().join("pipeline.json");
    fs::write(&json, r#"{ "rows": 4, "cols": 32, "activation": "relu" }"#)?;
    let config = PipelineConfig::from_path(&json)?;
    assert!(matches!(config.build()?, PipelineVariant::Plain(_)));

    let yaml = dir.path().join("pipeline.yaml");
    fs::write(&yaml, "rows: 4")?;
    assert!(matches!(
        PipelineConfig::from_path(&yaml),
        Err(FusedError::Configuration(message)) if message.contains("yaml")
    ));
    Ok(())
}

#[test]
fn invalid_file_reports_validation_errors() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("bad.toml");
    fs::write(&path, "rows = 4\ncols = 0\nactivation = \"tanh\"\n")?;
    match PipelineConfig::from_path(&path) {
        Err(FusedError::Configuration(message)) => {
            assert!(message.contains("cols"));
            assert!(message.contains("tanh"));
        }
        other => panic!("expected configuration error, got {other:?}"),
    }
    Ok(())
}
