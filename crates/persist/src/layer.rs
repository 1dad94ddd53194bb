//! In-memory form of an exported layer.

use std::collections::{BTreeMap, BTreeSet};

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::errors::{PersistError, Result};

/// One callable entry of the program with the parameters it reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDesc {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramDesc {
    pub functions: Vec<FunctionDesc>,
}

impl ProgramDesc {
    /// Every parameter name any function reads, deduplicated and sorted.
    pub fn referenced_params(&self) -> BTreeSet<String> {
        self.functions
            .iter()
            .flat_map(|function| function.params.iter().cloned())
            .collect()
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDesc> {
        self.functions.iter().find(|function| function.name == name)
    }
}

/// Scalar or list metadata stored next to the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f64>),
    Strings(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct Layer {
    pub program: ProgramDesc,
    pub params: BTreeMap<String, Tensor>,
    pub attrs: BTreeMap<String, Attribute>,
}

impl Layer {
    pub fn new(program: ProgramDesc) -> Self {
        Self {
            program,
            ..Self::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.params.insert(name.into(), tensor);
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: Attribute) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn param(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    pub fn attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }
}

/// Rejects names that cannot be used as a single file name.
pub fn validate_param_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(PersistError::InvalidName(name.to_string()));
    }
    Ok(())
}
