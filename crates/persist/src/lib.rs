//! Directory-based persistence for layers: a program descriptor, an
//! attribute table and one safetensors file per parameter, tied together by
//! a checksummed manifest.

pub mod deserializer;
pub mod errors;
pub mod layer;
pub mod manifest;
pub mod serializer;

pub use deserializer::{load, Deserializer};
pub use errors::{PersistError, Result};
pub use layer::{validate_param_name, Attribute, FunctionDesc, Layer, ProgramDesc};
pub use manifest::{FileRecord, Manifest, FORMAT_VERSION};
pub use serializer::{export, Serializer};
