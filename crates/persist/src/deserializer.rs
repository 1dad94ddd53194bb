//! Reads a directory written by [`export`](crate::export) back into a [`Layer`].

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use candle_core::{Device, Tensor};

use crate::errors::{PersistError, Result};
use crate::layer::{validate_param_name, Attribute, Layer, ProgramDesc};
use crate::manifest::{
    param_filename, read_json, validate_file, Manifest, ATTRIBUTES_FILENAME, FORMAT_VERSION, MANIFEST_FILENAME,
    PROGRAM_FILENAME,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct Deserializer;

impl Deserializer {
    pub fn deserialize(&self, dir: &Path, device: &Device) -> Result<Layer> {
        let manifest: Manifest = read_json(&dir.join(MANIFEST_FILENAME))?;
        if manifest.version != FORMAT_VERSION {
            return Err(PersistError::UnsupportedVersion {
                found: manifest.version,
                expected: FORMAT_VERSION,
            });
        }

        let program: ProgramDesc = read_checked(dir, &manifest, PROGRAM_FILENAME)?;
        let attrs: BTreeMap<String, Attribute> = read_checked(dir, &manifest, ATTRIBUTES_FILENAME)?;
        let params = self.read_tensor_data(dir, &manifest, &program.referenced_params(), device)?;

        log::info!(
            "loaded layer from {}: {} functions, {} params, {} attrs",
            dir.display(),
            program.functions.len(),
            params.len(),
            attrs.len()
        );
        Ok(Layer {
            program,
            params,
            attrs,
        })
    }

    /// Loads only `names`; any other parameter file is left on disk.
    fn read_tensor_data(
        &self,
        dir: &Path,
        manifest: &Manifest,
        names: &BTreeSet<String>,
        device: &Device,
    ) -> Result<BTreeMap<String, Tensor>> {
        let mut params = BTreeMap::new();
        for name in names {
            validate_param_name(name)?;
            let filename = param_filename(name);
            let record = manifest
                .record(&filename)
                .ok_or_else(|| PersistError::MissingParameter(name.clone()))?;
            validate_file(dir, record)?;
            let mut tensors = candle_core::safetensors::load(dir.join(&filename), device)?;
            let tensor = tensors
                .remove(name)
                .ok_or_else(|| PersistError::MissingParameter(name.clone()))?;
            params.insert(name.clone(), tensor);
        }
        Ok(params)
    }
}

fn read_checked<T: for<'de> serde::Deserialize<'de>>(dir: &Path, manifest: &Manifest, filename: &str) -> Result<T> {
    let record = manifest.record(filename).ok_or_else(|| PersistError::Unlisted {
        path: dir.join(filename),
    })?;
    validate_file(dir, record)?;
    read_json(&dir.join(filename))
}

/// Loads the layer stored in `dir`, placing parameters on `device`.
pub fn load(dir: impl AsRef<Path>, device: &Device) -> Result<Layer> {
    Deserializer.deserialize(dir.as_ref(), device)
}
