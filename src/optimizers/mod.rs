//! Optimizer abstractions for parameter updates.
//!
//! Every learnable buffer in the engine owns one optimizer instance, created
//! from a shared [`OptimizerConfig`] when its layer is bound. The config
//! holds the hyperparameters (learning rate, betas, epsilon) that all
//! instances of a model use; the instance holds the running statistics for
//! its own buffer and keeps them across steps until [`Optimizer::reset`].
//!
//! # Available Optimizers
//!
//! - Adam: bias-corrected first/second moment estimates
//! - AMSGrad: Adam with a non-decreasing second moment and no bias correction
//! - SGD: `w -= lr * g`
//!
//! # Example
//!
//! ```
//! use rust_neural_engine::optimizers::{OptimizerConfig, OptimizerKind};
//!
//! let config = OptimizerConfig::new(OptimizerKind::Adam, 0.01);
//! let mut optimizer = config.create(OptimizerKind::Adam);
//! let mut weights = vec![1.0f32, 2.0];
//! optimizer.update(&mut weights, &[0.5, -0.5]);
//! assert!(weights[0] < 1.0 && weights[1] > 2.0);
//! ```

pub mod adam;
pub mod amsgrad;
pub mod sgd;

pub use adam::Adam;
pub use amsgrad::AmsGrad;
pub use sgd::SGD;

use crate::error::{NetworkError, Result};
use crate::serialization::{ModelReader, ModelWriter};
use serde::{Deserialize, Serialize};

/// Core trait for parameter optimizers.
pub trait Optimizer: Send {
    /// One step over `parameters` in place.
    ///
    /// # Panics
    ///
    /// If `gradients` is not exactly as long as `parameters`.
    fn update(&mut self, parameters: &mut [f32], gradients: &[f32]);

    /// Clears the running statistics and step counter.
    fn reset(&mut self);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);

    fn kind(&self) -> OptimizerKind;

    /// Writes `t`, then the length-prefixed `m` and `v` buffers.
    fn export_state(&self, writer: &mut ModelWriter<'_>) -> Result<()>;

    /// Reads the record written by [`Optimizer::export_state`].
    fn import_state(&mut self, reader: &mut ModelReader<'_>) -> Result<()>;

    /// Length of the running moment buffers; zero before the first step.
    fn moment_len(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    #[serde(rename = "amsgrad")]
    AmsGrad,
    Sgd,
}

impl OptimizerKind {
    pub fn tag(&self) -> &'static str {
        match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::AmsGrad => "amsgrad",
            OptimizerKind::Sgd => "sgd",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "adam" => Ok(OptimizerKind::Adam),
            "amsgrad" => Ok(OptimizerKind::AmsGrad),
            "sgd" => Ok(OptimizerKind::Sgd),
            other => Err(NetworkError::Serialization(format!(
                "unknown optimizer tag '{}'",
                other
            ))),
        }
    }
}

/// Hyperparameters shared by every optimizer instance of a model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    #[serde(rename = "type")]
    pub kind: OptimizerKind,
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl OptimizerConfig {
    pub fn new(kind: OptimizerKind, learning_rate: f32) -> Self {
        Self {
            kind,
            learning_rate,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(NetworkError::Config(
                "learning_rate must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(NetworkError::Config(
                "beta1 and beta2 must be in [0, 1)".to_string(),
            ));
        }
        if !(self.epsilon > 0.0) {
            return Err(NetworkError::Config("epsilon must be positive".to_string()));
        }
        Ok(())
    }

    /// Creates a fresh optimizer instance of `kind` with these hyperparameters.
    pub fn create(&self, kind: OptimizerKind) -> Box<dyn Optimizer> {
        match kind {
            OptimizerKind::Adam => Box::new(Adam::new(
                self.learning_rate,
                self.beta1,
                self.beta2,
                self.epsilon,
            )),
            OptimizerKind::AmsGrad => Box::new(AmsGrad::new(
                self.learning_rate,
                self.beta1,
                self.beta2,
                self.epsilon,
            )),
            OptimizerKind::Sgd => Box::new(SGD::new(self.learning_rate)),
        }
    }
}

/// Running first/second moments and the step counter of one buffer.
///
/// The serialized record is `t`, then the length-prefixed `m` and `v`
/// buffers. SGD writes the same record with both buffers empty.
#[derive(Debug, Default, Clone)]
pub(crate) struct Moments {
    pub t: usize,
    pub m: Vec<f32>,
    pub v: Vec<f32>,
}

impl Moments {
    /// Sizes the buffers for `len` values on first use and bumps `t`.
    pub fn advance(&mut self, len: usize) -> i32 {
        if self.m.len() != len {
            self.m.resize(len, 0.0);
            self.v.resize(len, 0.0);
        }
        self.t += 1;
        self.t as i32
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn export(&self, writer: &mut ModelWriter<'_>) -> Result<()> {
        writer.write_usize(self.t)?;
        writer.write_vec(&self.m)?;
        writer.write_vec(&self.v)
    }

    pub fn import(reader: &mut ModelReader<'_>) -> Result<Self> {
        let t = reader.read_usize()?;
        let m = reader.read_vec()?;
        let v = reader.read_vec()?;
        if m.len() != v.len() {
            return Err(NetworkError::Serialization(format!(
                "moment buffers differ in length: {} vs {}",
                m.len(),
                v.len()
            )));
        }
        Ok(Self { t, m, v })
    }
}

pub(crate) fn check_lengths(parameters: &[f32], gradients: &[f32]) {
    assert_eq!(
        parameters.len(),
        gradients.len(),
        "gradient buffer does not match its parameter buffer"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        for kind in [OptimizerKind::Adam, OptimizerKind::AmsGrad, OptimizerKind::Sgd] {
            assert_eq!(OptimizerKind::from_tag(kind.tag()).unwrap(), kind);
        }
        assert!(OptimizerKind::from_tag("rmsprop").is_err());
    }

    #[test]
    fn test_config_create_uses_shared_hyperparameters() {
        let config = OptimizerConfig::new(OptimizerKind::Sgd, 0.25);
        for kind in [OptimizerKind::Adam, OptimizerKind::AmsGrad, OptimizerKind::Sgd] {
            let optimizer = config.create(kind);
            assert_eq!(optimizer.kind(), kind);
            assert_eq!(optimizer.learning_rate(), 0.25);
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(OptimizerConfig::default().validate().is_ok());
        assert!(OptimizerConfig::new(OptimizerKind::Adam, 0.0).validate().is_err());
        let config = OptimizerConfig {
            beta2: 1.0,
            ..OptimizerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: OptimizerConfig =
            serde_json::from_str(r#"{"type": "amsgrad", "learning_rate": 0.01}"#).unwrap();
        assert_eq!(config.kind, OptimizerKind::AmsGrad);
        assert_eq!(config.learning_rate, 0.01);
        assert_eq!(config.beta1, 0.9);
    }
}
