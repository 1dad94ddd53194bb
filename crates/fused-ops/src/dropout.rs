//! Dropout parameters and the per-call seed resolver.
//!
//! A [`DropoutParam`] carries the static configuration of one dropout site
//! (probability, scaling mode, train/test flag, seed policy) plus the seed and
//! increment resolved for the most recent forward call.
//!
//! Seed policy, checked in order on every forward call:
//!
//! 1. `fix_seed`: the static `seed_val` is reused and the generator is left
//!    untouched, so runs are reproducible.
//! 2. Otherwise the generator always advances by the requested increment.
//!    If an external seed tensor is attached, its first element becomes the
//!    seed; if not, the seed and pre-advance offset come from the generator.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{FusedError, Result};
use crate::generator::OffsetGenerator;

/// How kept activations are scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropoutImplementation {
    /// Train: kept values are scaled by `1 / (1 - p)`. Test: identity.
    UpscaleInTrain,
    /// Train: kept values pass unchanged. Test: everything is scaled by `1 - p`.
    DowngradeInInfer,
}

impl DropoutImplementation {
    /// Any name other than `"upscale_in_train"` selects downgrade-in-infer.
    pub fn from_name(name: &str) -> Self {
        if name == "upscale_in_train" {
            Self::UpscaleInTrain
        } else {
            Self::DowngradeInInfer
        }
    }
}

impl Default for DropoutImplementation {
    fn default() -> Self {
        Self::DowngradeInInfer
    }
}

/// Configuration and resolved seed state of one dropout site.
#[derive(Debug, Clone)]
pub struct DropoutParam {
    pub probability: f32,
    pub implementation: DropoutImplementation,
    pub is_test: bool,
    pub fix_seed: bool,
    /// Static seed used when `fix_seed` is set.
    pub seed_val: u64,
    /// External per-call seed source.
    pub seed_tensor: Option<Tensor>,
    seed: u64,
    increment: u64,
}

impl Default for DropoutParam {
    fn default() -> Self {
        Self {
            probability: 0.5,
            implementation: DropoutImplementation::DowngradeInInfer,
            is_test: false,
            fix_seed: false,
            seed_val: 0,
            seed_tensor: None,
            seed: 0,
            increment: 0,
        }
    }
}

impl DropoutParam {
    pub fn new(probability: f32, implementation: DropoutImplementation, is_test: bool) -> Self {
        Self {
            probability,
            implementation,
            is_test,
            ..Self::default()
        }
    }

    /// Pins the seed to `seed_val` for every call.
    pub fn with_fixed_seed(mut self, seed_val: u64) -> Self {
        self.fix_seed = true;
        self.seed_val = seed_val;
        self
    }

    pub fn with_seed_tensor(mut self, seed_tensor: Tensor) -> Self {
        self.seed_tensor = Some(seed_tensor);
        self
    }

    /// Reads a dropout site from an operator attribute map.
    ///
    /// `index` 0 uses the `dropout_` prefix, 1 and 2 use `dropout1_` and
    /// `dropout2_` for blocks that carry two dropouts. Keys: `rate`,
    /// `implementation`, `fix_seed`, `seed`, and the unprefixed `is_test`.
    pub fn from_attributes(attrs: &Map<String, Value>, index: usize) -> Result<Self> {
        if index > 2 {
            return Err(FusedError::configuration(format!(
                "dropout index must be 0, 1 or 2, got {index}"
            )));
        }
        let prefix = if index > 0 {
            format!("dropout{index}_")
        } else {
            "dropout_".to_string()
        };
        let key = |name: &str| format!("{prefix}{name}");

        let mut param = Self::default();
        if let Some(value) = attrs.get(&key("rate")) {
            param.probability = value
                .as_f64()
                .ok_or_else(|| attr_type_error(&key("rate"), "a number"))?
                as f32;
        }
        if let Some(value) = attrs.get(&key("implementation")) {
            let name = value
                .as_str()
                .ok_or_else(|| attr_type_error(&key("implementation"), "a string"))?;
            param.implementation = DropoutImplementation::from_name(name);
        }
        if let Some(value) = attrs.get("is_test") {
            param.is_test = value
                .as_bool()
                .ok_or_else(|| attr_type_error("is_test", "a bool"))?;
        }
        if let Some(value) = attrs.get(&key("fix_seed")) {
            param.fix_seed = value
                .as_bool()
                .ok_or_else(|| attr_type_error(&key("fix_seed"), "a bool"))?;
        }
        if let Some(value) = attrs.get(&key("seed")) {
            param.seed_val = value
                .as_i64()
                .ok_or_else(|| attr_type_error(&key("seed"), "an integer"))?
                as u64;
        }
        param.validate()?;
        Ok(param)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(FusedError::configuration(format!(
                "dropout probability must be in [0, 1], got {}",
                self.probability
            )));
        }
        Ok(())
    }

    pub fn is_upscale_in_train(&self) -> bool {
        self.implementation == DropoutImplementation::UpscaleInTrain
    }

    /// Seed resolved by the last [`update_seed_and_increment`](Self::update_seed_and_increment).
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Stream offset resolved by the last call.
    pub fn increment(&self) -> u64 {
        self.increment
    }

    /// Scale applied to surviving elements in the forward pass.
    pub fn forward_factor(&self) -> f32 {
        match (self.is_test, self.implementation) {
            (true, DropoutImplementation::UpscaleInTrain) => 1.0,
            (true, DropoutImplementation::DowngradeInInfer) => 1.0 - self.probability,
            (false, DropoutImplementation::DowngradeInInfer) => 1.0,
            (false, DropoutImplementation::UpscaleInTrain) => upscale(self.probability),
        }
    }

    /// Scale the backward pass applies to kept gradients (always train mode).
    pub fn grad_factor(&self) -> f32 {
        if self.is_upscale_in_train() {
            upscale(self.probability)
        } else {
            1.0
        }
    }

    /// True when the forward pass draws a mask at all.
    pub fn samples_mask(&self) -> bool {
        !self.is_test && self.probability > 0.0
    }

    /// Resolves the seed for this call and advances the generator.
    ///
    /// `offset` is the number of stream positions the launch will consume.
    /// Returns the increment the kernel must use as its stream offset.
    pub fn update_seed_and_increment<G>(&mut self, generator: &mut G, offset: u64) -> Result<u64>
    where
        G: OffsetGenerator + ?Sized,
    {
        if self.fix_seed {
            self.seed = self.seed_val;
            self.increment = offset;
        } else {
            let drawn = generator.increment_offset(offset)?;
            match &self.seed_tensor {
                Some(tensor) => {
                    self.seed = read_seed(tensor)?;
                    self.increment = offset;
                }
                None => {
                    self.seed = drawn.seed;
                    self.increment = drawn.offset;
                }
            }
        }
        log::debug!(
            "dropout seed resolved: seed={} increment={} fix_seed={} external={}",
            self.seed,
            self.increment,
            self.fix_seed,
            self.seed_tensor.is_some()
        );
        Ok(self.increment)
    }
}

fn upscale(probability: f32) -> f32 {
    if probability >= 1.0 {
        0.0
    } else {
        1.0 / (1.0 - probability)
    }
}

fn read_seed(tensor: &Tensor) -> Result<u64> {
    if tensor.elem_count() == 0 {
        return Err(FusedError::shape("dropout seed tensor must not be empty"));
    }
    let first = tensor
        .flatten_all()?
        .narrow(0, 0, 1)?
        .to_dtype(DType::I64)?
        .to_vec1::<i64>()?;
    Ok(first[0] as u64)
}

fn attr_type_error(key: &str, expected: &str) -> FusedError {
    FusedError::configuration(format!("attribute `{key}` must be {expected}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::GeneratorState;
    use candle_core::Device;
    use serde_json::json;

    #[test]
    fn fixed_seed_ignores_generator_and_seed_tensor() -> Result<()> {
        let seed_tensor = Tensor::new(&[99i64], &Device::Cpu)?;
        let mut param = DropoutParam::new(0.1, DropoutImplementation::UpscaleInTrain, false)
            .with_fixed_seed(7)
            .with_seed_tensor(seed_tensor);
        let mut state = GeneratorState::new(1);
        let increment = param.update_seed_and_increment(&mut state, 8)?;
        assert_eq!((param.seed(), increment), (7, 8));
        assert_eq!(state.current().offset, 0);
        Ok(())
    }

    #[test]
    fn seed_tensor_wins_but_generator_still_advances() -> Result<()> {
        let seed_tensor = Tensor::new(&[1234u32], &Device::Cpu)?;
        let mut param = DropoutParam::default().with_seed_tensor(seed_tensor);
        let mut state = GeneratorState::with_offset(5, 40);
        let increment = param.update_seed_and_increment(&mut state, 4)?;
        assert_eq!(param.seed(), 1234);
        assert_eq!(increment, 4);
        assert_eq!(state.current().offset, 44);
        Ok(())
    }

    #[test]
    fn generator_path_returns_previous_offset() -> Result<()> {
        let mut param = DropoutParam::default();
        let mut state = GeneratorState::with_offset(3, 12);
        assert_eq!(param.update_seed_and_increment(&mut state, 4)?, 12);
        assert_eq!(param.seed(), 3);
        assert_eq!(param.update_seed_and_increment(&mut state, 4)?, 16);
        Ok(())
    }

    #[test]
    fn factors_follow_scaling_mode() {
        let upscale = DropoutParam::new(0.25, DropoutImplementation::UpscaleInTrain, false);
        assert!((upscale.forward_factor() - 4.0 / 3.0).abs() < 1e-6);
        assert_eq!(upscale.grad_factor(), upscale.forward_factor());

        let downgrade_train = DropoutParam::new(0.25, DropoutImplementation::DowngradeInInfer, false);
        assert_eq!(downgrade_train.forward_factor(), 1.0);
        assert_eq!(downgrade_train.grad_factor(), 1.0);
        assert!(downgrade_train.samples_mask());

        let downgrade_test = DropoutParam::new(0.25, DropoutImplementation::DowngradeInInfer, true);
        assert!((downgrade_test.forward_factor() - 0.75).abs() < 1e-6);
        assert!(!downgrade_test.samples_mask());

        let everything_dropped = DropoutParam::new(1.0, DropoutImplementation::UpscaleInTrain, false);
        assert_eq!(everything_dropped.forward_factor(), 0.0);
    }

    #[test]
    fn attributes_use_indexed_prefixes() -> Result<()> {
        let attrs = json!({
            "dropout1_rate": 0.3,
            "dropout1_implementation": "upscale_in_train",
            "dropout1_fix_seed": true,
            "dropout1_seed": 42,
            "dropout_rate": 0.9,
            "is_test": true,
        });
        let attrs = attrs.as_object().cloned().unwrap_or_default();
        let param = DropoutParam::from_attributes(&attrs, 1)?;
        assert!((param.probability - 0.3).abs() < 1e-6);
        assert!(param.is_upscale_in_train());
        assert!(param.fix_seed && param.is_test);
        assert_eq!(param.seed_val, 42);

        let first = DropoutParam::from_attributes(&attrs, 0)?;
        assert!((first.probability - 0.9).abs() < 1e-6);
        assert_eq!(first.implementation, DropoutImplementation::DowngradeInInfer);
        assert!(DropoutParam::from_attributes(&attrs, 3).is_err());
        Ok(())
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        let attrs = json!({ "dropout_rate": 1.5 });
        let attrs = attrs.as_object().cloned().unwrap_or_default();
        assert!(matches!(
            DropoutParam::from_attributes(&attrs, 0),
            Err(FusedError::Configuration(_))
        ));
    }
}
