//! Writes a [`Layer`] to a directory.
//!
//! Layout:
//!
//! ```text
//! <dir>/program.json
//! <dir>/attributes.json
//! <dir>/params/<name>.safetensors   one tensor per file
//! <dir>/manifest.json               sha256 of every file above
//! ```

use std::{collections::HashMap, fs, path::Path};

use crate::errors::{PersistError, Result};
use crate::layer::{validate_param_name, Layer};
use crate::manifest::{
    file_record, param_filename, write_json, Manifest, ATTRIBUTES_FILENAME, FORMAT_VERSION, MANIFEST_FILENAME,
    PARAMS_DIR, PROGRAM_FILENAME,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct Serializer;

impl Serializer {
    pub fn serialize(&self, layer: &Layer, dir: &Path) -> Result<Manifest> {
        for name in layer.params.keys() {
            validate_param_name(name)?;
        }
        for name in layer.program.referenced_params() {
            validate_param_name(&name)?;
            if !layer.params.contains_key(&name) {
                return Err(PersistError::MissingParameter(name));
            }
        }

        let params_dir = dir.join(PARAMS_DIR);
        fs::create_dir_all(&params_dir).map_err(|err| PersistError::io(&params_dir, err))?;

        write_json(&dir.join(PROGRAM_FILENAME), &layer.program)?;
        write_json(&dir.join(ATTRIBUTES_FILENAME), &layer.attrs)?;
        let mut files = vec![
            file_record(dir, PROGRAM_FILENAME)?,
            file_record(dir, ATTRIBUTES_FILENAME)?,
        ];

        for (name, tensor) in &layer.params {
            let filename = param_filename(name);
            let tensors = HashMap::from([(name.clone(), tensor.clone())]);
            candle_core::safetensors::save(&tensors, dir.join(&filename))?;
            files.push(file_record(dir, &filename)?);
        }

        let manifest = Manifest {
            version: FORMAT_VERSION,
            files,
        };
        write_json(&dir.join(MANIFEST_FILENAME), &manifest)?;
        log::info!(
            "exported layer to {}: {} functions, {} params, {} attrs",
            dir.display(),
            layer.program.functions.len(),
            layer.params.len(),
            layer.attrs.len()
        );
        Ok(manifest)
    }
}

/// Exports `layer` into `dir`, creating it if needed.
pub fn export(layer: &Layer, dir: impl AsRef<Path>) -> Result<Manifest> {
    Serializer.serialize(layer, dir.as_ref())
}
