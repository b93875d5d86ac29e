//! Configuration structures for training
//!
//! This module provides the training-loop configuration read from JSON:
//! batch size, epoch count, checkpointing, the seed and the optimizer
//! hyperparameters shared by every parameter of a model.

use crate::error::{NetworkError, Result};
use crate::optimizers::OptimizerConfig;
use serde::Deserialize;
use std::fs;
use std::path::Path;

fn default_batch_size() -> usize {
    32
}

fn default_epochs() -> usize {
    1
}

fn default_seed() -> u64 {
    42
}

/// Training-loop settings.
///
/// Every field has a default, so `{}` is a valid configuration.
///
/// # Example
///
/// ```json
/// {
///   "batch_size": 16,
///   "epochs": 10,
///   "checkpoint_interval": 100,
///   "checkpoint_name": "checkpoints/model.bin",
///   "seed": 7,
///   "optimizer": { "type": "amsgrad", "learning_rate": 0.005 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrainingConfig {
    /// Examples per batch; the final batch of an epoch may be shorter.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Passes over the dataset.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Save a checkpoint every this many batches.
    pub checkpoint_interval: Option<usize>,

    /// Checkpoint file path, overwritten at every checkpoint.
    pub checkpoint_name: Option<String>,

    /// Seeds weight initialization, dropout masks and epoch shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            checkpoint_interval: None,
            checkpoint_name: None,
            seed: default_seed(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

/// Loads a training configuration from a JSON file.
///
/// Reads the file at `path`, deserializes it and validates the values.
///
/// # Errors
///
/// `Io` when the file cannot be read, `Json` when it is not valid JSON for
/// this structure, and `Config` when a value is out of range.
///
/// # Examples
///
/// ```no_run
/// use rust_neural_engine::config::load_config;
///
/// let cfg = load_config("config/training.json").unwrap();
/// assert!(cfg.batch_size > 0);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)?;
    let config: TrainingConfig = serde_json::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Checks value ranges that serde cannot express.
pub fn validate_config(config: &TrainingConfig) -> Result<()> {
    if config.batch_size == 0 {
        return Err(NetworkError::Config("batch_size must be positive".to_string()));
    }
    if config.epochs == 0 {
        return Err(NetworkError::Config("epochs must be positive".to_string()));
    }
    if config.checkpoint_interval == Some(0) {
        return Err(NetworkError::Config(
            "checkpoint_interval must be positive".to_string(),
        ));
    }
    if config.checkpoint_interval.is_some() && config.checkpoint_name.is_none() {
        return Err(NetworkError::Config(
            "checkpoint_interval requires checkpoint_name".to_string(),
        ));
    }
    config.optimizer.validate()
}
