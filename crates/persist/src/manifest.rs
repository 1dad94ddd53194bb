//! Checksummed file inventory written last during export.

use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};

use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{PersistError, Result};

pub const FORMAT_VERSION: u32 = 1;
pub const MANIFEST_FILENAME: &str = "manifest.json";
pub const PROGRAM_FILENAME: &str = "program.json";
pub const ATTRIBUTES_FILENAME: &str = "attributes.json";
pub const PARAMS_DIR: &str = "params";
pub const PARAM_EXTENSION: &str = "safetensors";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the layer directory, `/`-separated.
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub files: Vec<FileRecord>,
}

impl Manifest {
    pub fn record(&self, filename: &str) -> Option<&FileRecord> {
        self.files.iter().find(|record| record.filename == filename)
    }
}

/// Relative file name of a parameter inside the layer directory.
pub fn param_filename(name: &str) -> String {
    format!("{PARAMS_DIR}/{name}.{PARAM_EXTENSION}")
}

pub(crate) fn file_record(root: &Path, filename: &str) -> Result<FileRecord> {
    let path = root.join(filename);
    let bytes = path.metadata().map_err(|err| PersistError::io(&path, err))?.len();
    Ok(FileRecord {
        filename: filename.to_string(),
        sha256: sha256_file(&path)?,
        bytes,
    })
}

pub(crate) fn validate_file(root: &Path, record: &FileRecord) -> Result<()> {
    let path = root.join(&record.filename);
    if sha256_file(&path)? != record.sha256 {
        return Err(PersistError::Checksum { path });
    }
    Ok(())
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|err| PersistError::io(path, err))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| PersistError::io(path, err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).map_err(|err| PersistError::json(path, err))?;
    let mut file = File::create(path).map_err(|err| PersistError::io(path, err))?;
    file.write_all(&data).map_err(|err| PersistError::io(path, err))?;
    file.write_all(b"\n").map_err(|err| PersistError::io(path, err))
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|err| PersistError::io(path, err))?;
    serde_json::from_reader(file).map_err(|err| PersistError::json(path, err))
}
