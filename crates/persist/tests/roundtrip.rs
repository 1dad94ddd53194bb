use std::fs;

use candle_core::{DType, Device, Tensor};
use persist::{export, load, Attribute, FunctionDesc, Layer, PersistError, ProgramDesc, FORMAT_VERSION};
use tempfile::tempdir;

fn sample_layer() -> Layer {
    let device = Device::Cpu;
    let program = ProgramDesc {
        functions: vec![FunctionDesc {
            name: "forward".into(),
            inputs: vec!["x".into(), "residual".into()],
            outputs: vec!["y".into()],
            params: vec!["ln.gamma".into(), "ln.beta".into(), "linear.bias".into()],
        }],
    };
    Layer::new(program)
        .with_param("ln.gamma", Tensor::ones(8, DType::F32, &device).unwrap())
        .with_param("ln.beta", Tensor::zeros(8, DType::F32, &device).unwrap())
        .with_param(
            "linear.bias",
            Tensor::arange(0f32, 8.0, &device).unwrap().to_dtype(DType::F16).unwrap(),
        )
        .with_param("optimizer.moment", Tensor::ones((2, 8), DType::F32, &device).unwrap())
        .with_attr("dropout_rate", Attribute::Float(0.1))
        .with_attr("dropout_implementation", Attribute::String("upscale_in_train".into()))
        .with_attr("is_test", Attribute::Bool(false))
        .with_attr("hidden_dims", Attribute::Ints(vec![2, 8]))
}

#[test]
fn export_then_load_restores_program_params_and_attrs() {
    let dir = tempdir().unwrap();
    let layer = sample_layer();
    let manifest = export(&layer, dir.path()).unwrap();
    assert_eq!(manifest.version, FORMAT_VERSION);
    assert!(dir.path().join("params/ln.gamma.safetensors").is_file());
    assert!(dir.path().join("program.json").is_file());
    assert!(dir.path().join("attributes.json").is_file());

    let loaded = load(dir.path(), &Device::Cpu).unwrap();
    assert_eq!(loaded.program, layer.program);
    assert_eq!(loaded.attrs, layer.attrs);

    let bias = loaded.param("linear.bias").unwrap();
    assert_eq!(bias.dtype(), DType::F16);
    assert_eq!(
        bias.to_dtype(DType::F32).unwrap().to_vec1::<f32>().unwrap(),
        (0..8).map(|v| v as f32).collect::<Vec<_>>()
    );
    // Only parameters the program references are read back.
    assert!(loaded.param("optimizer.moment").is_none());
    assert_eq!(loaded.params.len(), 3);
}

#[test]
fn tampered_parameter_fails_checksum() {
    let dir = tempdir().unwrap();
    export(&sample_layer(), dir.path()).unwrap();
    let path = dir.path().join("params/ln.beta.safetensors");
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&path, bytes).unwrap();

    let err = load(dir.path(), &Device::Cpu).unwrap_err();
    assert!(matches!(err, PersistError::Checksum { .. }), "{err}");
}

#[test]
fn program_referencing_a_missing_param_is_rejected() {
    let dir = tempdir().unwrap();
    let mut layer = sample_layer();
    layer.params.remove("ln.beta");
    let err = export(&layer, dir.path()).unwrap_err();
    assert!(matches!(err, PersistError::MissingParameter(name) if name == "ln.beta"));

    // A program edited after export cannot conjure parameters either.
    let layer = sample_layer();
    export(&layer, dir.path()).unwrap();
    let manifest_path = dir.path().join("manifest.json");
    let manifest = fs::read_to_string(&manifest_path).unwrap();
    let without_beta = manifest.replace("params/ln.beta.safetensors", "params/renamed.safetensors");
    fs::write(&manifest_path, without_beta).unwrap();
    let err = load(dir.path(), &Device::Cpu).unwrap_err();
    assert!(matches!(err, PersistError::MissingParameter(name) if name == "ln.beta"));
}

#[test]
fn unsupported_version_and_bad_names_are_errors() {
    let dir = tempdir().unwrap();
    export(&sample_layer(), dir.path()).unwrap();
    let manifest_path = dir.path().join("manifest.json");
    let manifest = fs::read_to_string(&manifest_path).unwrap();
    fs::write(&manifest_path, manifest.replace("\"version\": 1", "\"version\": 99")).unwrap();
    assert!(matches!(
        load(dir.path(), &Device::Cpu),
        Err(PersistError::UnsupportedVersion { found: 99, .. })
    ));

    let other = tempdir().unwrap();
    let layer = sample_layer().with_param("../escape", Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap());
    assert!(matches!(export(&layer, other.path()), Err(PersistError::InvalidName(_))));
}
