//! File-based configuration for a fused pipeline instance.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::dropout::{DropoutImplementation, DropoutParam};
use crate::errors::{FusedError, Result};
use crate::generator::GeneratorState;
use crate::geometry::DeviceCapabilities;
use crate::helper::{resolve_activation, FusedDropoutHelper};
use crate::layernorm::{FusedDropoutLayerNormHelper, PipelineVariant};
use layers::ActivationKind;

pub const ENV_FIX_SEED: &str = "FUSED_DROPOUT_FIX_SEED";
pub const ENV_SEED: &str = "FUSED_DROPOUT_SEED";
pub const ENV_MAX_THREADS: &str = "FUSED_MAX_THREADS_PER_BLOCK";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropoutConfig {
    #[serde(default = "default_rate")]
    pub rate: f32,
    #[serde(default)]
    pub implementation: DropoutImplementation,
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub fix_seed: bool,
    #[serde(default)]
    pub seed: u64,
}

impl Default for DropoutConfig {
    fn default() -> Self {
        Self {
            rate: default_rate(),
            implementation: DropoutImplementation::default(),
            is_test: false,
            fix_seed: false,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub rows: usize,
    pub cols: usize,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
    #[serde(default)]
    pub dropout: DropoutConfig,
    /// Activation for the act-bias pipeline, `gelu` or `relu`.
    #[serde(default = "default_activation")]
    pub activation: String,
    #[serde(default = "default_max_threads")]
    pub max_threads_per_block: usize,
    /// Seed of the generator created by [`PipelineConfig::generator_state`].
    #[serde(default)]
    pub generator_seed: u64,
    /// Build the layer-norm variant.
    #[serde(default)]
    pub layer_norm: bool,
}

impl PipelineConfig {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            epsilon: default_epsilon(),
            dropout: DropoutConfig::default(),
            activation: default_activation(),
            max_threads_per_block: default_max_threads(),
            generator_seed: 0,
            layer_norm: false,
        }
    }

    /// Loads a TOML or JSON file (chosen by extension) and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: PipelineConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|err| FusedError::configuration(format!("failed to parse config: {err}")))?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)
                .map_err(|err| FusedError::configuration(format!("failed to parse config: {err}")))?,
            Some(other) => {
                return Err(FusedError::configuration(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Collects every problem into one configuration error.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.rows == 0 {
            errors.push("rows must be greater than 0".to_string());
        }
        if self.cols == 0 {
            errors.push("cols must be greater than 0".to_string());
        }
        if !(self.epsilon.is_finite() && self.epsilon >= 0.0) {
            errors.push("epsilon must be finite and non-negative".to_string());
        }
        if !(0.0..=1.0).contains(&self.dropout.rate) {
            errors.push(format!("dropout.rate must be in [0, 1], got {}", self.dropout.rate));
        }
        if ActivationKind::from_name(&self.activation).is_none() {
            errors.push(format!(
                "activation must be `gelu` or `relu`, got `{}`",
                self.activation
            ));
        }
        if self.max_threads_per_block == 0 {
            errors.push("max_threads_per_block must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FusedError::configuration(errors.join("; ")))
        }
    }

    /// Applies `FUSED_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_FIX_SEED) {
            self.dropout.fix_seed = parse_flag(ENV_FIX_SEED, &value)?;
        }
        if let Some(value) = lookup(ENV_SEED) {
            self.dropout.seed = parse_number(ENV_SEED, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_THREADS) {
            self.max_threads_per_block = parse_number(ENV_MAX_THREADS, &value)?;
        }
        Ok(())
    }

    pub fn dropout_param(&self) -> DropoutParam {
        let mut param = DropoutParam::new(self.dropout.rate, self.dropout.implementation, self.dropout.is_test);
        param.fix_seed = self.dropout.fix_seed;
        param.seed_val = self.dropout.seed;
        param
    }

    pub fn capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities {
            max_threads_per_block: self.max_threads_per_block,
        }
    }

    pub fn activation_kind(&self) -> Result<ActivationKind> {
        resolve_activation(&self.activation)
    }

    pub fn generator_state(&self) -> GeneratorState {
        GeneratorState::new(self.generator_seed)
    }

    pub fn build_helper(&self) -> Result<FusedDropoutHelper> {
        FusedDropoutHelper::new(self.rows, self.cols, self.dropout_param(), self.capabilities())
    }

    pub fn build_layer_norm_helper(&self) -> Result<FusedDropoutLayerNormHelper> {
        FusedDropoutLayerNormHelper::new(
            self.rows,
            self.cols,
            self.dropout_param(),
            self.epsilon,
            self.capabilities(),
        )
    }

    /// Builds the variant selected by `layer_norm`.
    pub fn build(&self) -> Result<PipelineVariant> {
        self.validate()?;
        if self.layer_norm {
            Ok(PipelineVariant::WithLayerNorm(self.build_layer_norm_helper()?))
        } else {
            Ok(PipelineVariant::Plain(self.build_helper()?))
        }
    }
}

fn default_rate() -> f32 {
    0.5
}

fn default_epsilon() -> f32 {
    1e-5
}

fn default_activation() -> String {
    "gelu".to_string()
}

fn default_max_threads() -> usize {
    DeviceCapabilities::default().max_threads_per_block
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(FusedError::configuration(format!(
            "{key} must be a boolean flag, got `{other}`"
        ))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| FusedError::configuration(format!("{key} must be a non-negative integer, got `{value}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn toml_defaults_fill_missing_sections() -> Result<()> {
        let config: PipelineConfig = toml::from_str("rows = 8\ncols = 1024\n")
            .map_err(|err| FusedError::configuration(err.to_string()))?;
        config.validate()?;
        assert_eq!(config.dropout.rate, 0.5);
        assert_eq!(config.dropout.implementation, DropoutImplementation::DowngradeInInfer);
        assert_eq!(config.activation_kind()?, ActivationKind::Gelu);
        assert_eq!(config.capabilities(), DeviceCapabilities::default());
        Ok(())
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = PipelineConfig::new(0, 16);
        config.dropout.rate = 2.0;
        config.activation = "swish".to_string();
        let message = match config.validate() {
            Err(FusedError::Configuration(message)) => message,
            other => panic!("expected configuration error, got {other:?}"),
        };
        assert!(message.contains("rows"));
        assert!(message.contains("dropout.rate"));
        assert!(message.contains("swish"));
    }

    #[test]
    fn overrides_pin_seed_and_threads() -> Result<()> {
        let env: HashMap<&str, &str> = [(ENV_FIX_SEED, "true"), (ENV_SEED, "77"), (ENV_MAX_THREADS, "256")]
            .into_iter()
            .collect();
        let mut config = PipelineConfig::new(4, 64);
        config.apply_overrides_from(|key| env.get(key).map(|v| v.to_string()))?;
        let param = config.dropout_param();
        assert!(param.fix_seed);
        assert_eq!(param.seed_val, 77);
        assert_eq!(config.capabilities().max_threads_per_block, 256);

        let bad = |key: &str| (key == ENV_SEED).then(|| "-3".to_string());
        assert!(config.apply_overrides_from(bad).is_err());
        Ok(())
    }

    #[test]
    fn build_selects_the_variant() -> Result<()> {
        let mut config = PipelineConfig::new(2, 8);
        assert!(matches!(config.build()?, PipelineVariant::Plain(_)));
        config.layer_norm = true;
        config.epsilon = 1e-6;
        let variant = config.build()?;
        assert_eq!(variant.layer_norm().map(|h| h.epsilon()), Some(1e-6));
        Ok(())
    }
}
