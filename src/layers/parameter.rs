//! Learnable parameter buffers.
//!
//! A [`Parameter`] pairs a value buffer with a gradient buffer of the same
//! length and the optimizer instance that owns the running statistics for
//! those values.

use crate::error::{NetworkError, Result};
use crate::optimizers::Optimizer;
use crate::serialization::{ModelReader, ModelWriter};
use crate::utils::SimpleRng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Weight initialization scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initializer {
    /// Uniform in `±sqrt(6 / (fan_in + fan_out))`.
    #[default]
    Xavier,
    /// Uniform in `±sqrt(6 / fan_in)`.
    He,
}

impl Initializer {
    pub fn tag(&self) -> &'static str {
        match self {
            Initializer::Xavier => "xavier",
            Initializer::He => "he",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "xavier" => Ok(Initializer::Xavier),
            "he" => Ok(Initializer::He),
            other => Err(NetworkError::Serialization(format!(
                "unknown initializer tag '{}'",
                other
            ))),
        }
    }

    pub fn limit(&self, fan_in: usize, fan_out: usize) -> f32 {
        match self {
            Initializer::Xavier => (6.0f32 / (fan_in + fan_out) as f32).sqrt(),
            Initializer::He => (6.0f32 / fan_in as f32).sqrt(),
        }
    }

    /// Draws `len` values.
    pub fn sample(&self, len: usize, fan_in: usize, fan_out: usize, rng: &mut SimpleRng) -> Vec<f32> {
        let limit = self.limit(fan_in.max(1), fan_out.max(1));
        (0..len).map(|_| rng.gen_range_f32(-limit, limit)).collect()
    }
}

/// A named learnable buffer with its gradient and optimizer state.
pub struct Parameter {
    name: &'static str,
    values: Vec<f32>,
    gradients: Vec<f32>,
    optimizer: Box<dyn Optimizer>,
}

impl Parameter {
    pub fn new(name: &'static str, values: Vec<f32>, optimizer: Box<dyn Optimizer>) -> Self {
        let gradients = vec![0.0f32; values.len()];
        Self {
            name,
            values,
            gradients,
            optimizer,
        }
    }

    pub fn filled(name: &'static str, len: usize, value: f32, optimizer: Box<dyn Optimizer>) -> Self {
        Self::new(name, vec![value; len], optimizer)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn gradients(&self) -> &[f32] {
        &self.gradients
    }

    pub fn gradients_mut(&mut self) -> &mut [f32] {
        &mut self.gradients
    }

    /// Values and gradients borrowed together (read values, accumulate gradients).
    pub fn split_mut(&mut self) -> (&[f32], &mut [f32]) {
        (&self.values, &mut self.gradients)
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn zero_gradients(&mut self) {
        self.gradients.iter_mut().for_each(|g| *g = 0.0);
    }

    /// Divides the accumulated gradient by `batch_scale`, applies one
    /// optimizer step and clears the gradient.
    pub fn apply_update(&mut self, batch_scale: f32) {
        if batch_scale != 1.0 && batch_scale > 0.0 {
            let inv = 1.0 / batch_scale;
            self.gradients.iter_mut().for_each(|g| *g *= inv);
        }
        self.optimizer.update(&mut self.values, &self.gradients);
        self.zero_gradients();
    }

    /// Writes the optimizer record followed by the values.
    pub fn export(&self, writer: &mut ModelWriter<'_>) -> Result<()> {
        self.optimizer.export_state(writer)?;
        writer.write_values(&self.values)
    }

    /// Reads the record written by [`Parameter::export`] into the already
    /// allocated buffers.
    pub fn import(&mut self, reader: &mut ModelReader<'_>) -> Result<()> {
        self.optimizer.import_state(reader)?;
        let moments = self.optimizer.moment_len();
        if moments != 0 && moments != self.values.len() {
            return Err(NetworkError::Serialization(format!(
                "{}: optimizer state holds {} moments for {} values",
                self.name,
                moments,
                self.values.len()
            )));
        }
        reader.read_values_into(&mut self.values)?;
        self.zero_gradients();
        Ok(())
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("len", &self.values.len())
            .field("optimizer", &self.optimizer.kind())
            .finish()
    }
}
