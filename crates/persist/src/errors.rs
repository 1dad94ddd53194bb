//! Errors raised while exporting or loading a layer directory.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} failed checksum validation")]
    Checksum { path: PathBuf },
    #[error("{path} is not listed in the manifest")]
    Unlisted { path: PathBuf },
    #[error("unsupported layer format version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("parameter `{0}` is referenced by the program but missing")]
    MissingParameter(String),
    #[error("invalid parameter name `{0}`")]
    InvalidName(String),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PersistError>;
