//! Dropout layer implementation for regularization
//!
//! This module provides a DropoutLayer that randomly drops (sets to zero) a fraction
//! of input units during training to prevent overfitting. Outside of training,
//! all units are kept and outputs are passed through unchanged.

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{pop_step, record_step, BindContext, Layer, Mode, Parameter};
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::Shape;
use crate::utils::SimpleRng;

pub const TYPE_TAG: &str = "dropout";

/// Dropout layer for regularization.
///
/// In `Train` mode each unit is dropped with probability `drop_rate` and
/// the kept units are scaled by `1 / (1 - drop_rate)` so the expected
/// activation is unchanged. In `Eval` and `GradientCheck` modes the layer
/// is the identity.
///
/// # Example
///
/// ```
/// use rust_neural_engine::layers::{BindContext, DropoutLayer, Layer, Mode};
/// use rust_neural_engine::tensor::Shape;
///
/// let mut layer = DropoutLayer::new(0.5).unwrap();
/// layer.bind(Shape::flat(4), &mut BindContext::with_seed(42)).unwrap();
/// layer.set_mode(Mode::Eval);
/// let out = layer.forward(&[1.0, 2.0, 3.0, 4.0], 1).unwrap();
/// assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
/// ```
pub struct DropoutLayer {
    drop_rate: f32,
    shape: Shape,
    rng: SimpleRng,
    mode: Mode,
    history: Vec<DropoutStep>,
}

struct DropoutStep {
    /// Per-unit multiplier: `0` or `1 / (1 - p)`; empty when inert.
    mask: Vec<f32>,
    output: Vec<f32>,
    batch_size: usize,
}

impl DropoutLayer {
    /// Creates a dropout layer; `drop_rate` must lie in `[0, 1)`.
    pub fn new(drop_rate: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&drop_rate) {
            return Err(NetworkError::Config(format!(
                "drop_rate must be in range [0.0, 1.0), got {}",
                drop_rate
            )));
        }
        Ok(Self {
            drop_rate,
            shape: Shape::flat(0),
            rng: SimpleRng::new(0),
            mode: Mode::Train,
            history: Vec::new(),
        })
    }

    /// Get the dropout rate.
    pub fn drop_rate(&self) -> f32 {
        self.drop_rate
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let drop_rate = reader.read_f32()?;
        let mut layer =
            DropoutLayer::new(drop_rate).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        let rebuilt = layer.bind(input, ctx).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        Ok(layer)
    }
}

impl Layer for DropoutLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        self.shape = input;
        self.rng = ctx.rng.fork();
        self.history.clear();
        Ok(input)
    }

    fn input_shape(&self) -> Shape {
        self.shape
    }

    fn output_shape(&self) -> Shape {
        self.shape
    }

    fn forward(&mut self, input: &[f32], batch_size: usize) -> Result<Vec<f32>> {
        check_batch(batch_size)?;
        check_len(input.len(), batch_size * self.shape.size())?;

        let mut mask = Vec::new();
        let output = if self.mode == Mode::Train && self.drop_rate > 0.0 {
            let scale = 1.0 / (1.0 - self.drop_rate);
            mask.reserve(input.len());
            for _ in 0..input.len() {
                let keep = self.rng.next_f32() > self.drop_rate;
                mask.push(if keep { scale } else { 0.0 });
            }
            input.iter().zip(&mask).map(|(x, m)| x * m).collect()
        } else {
            input.to_vec()
        };

        record_step(
            &mut self.history,
            self.mode,
            DropoutStep {
                mask,
                output: output.clone(),
                batch_size,
            },
        );
        Ok(output)
    }

    fn backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        let step = pop_step(&mut self.history, TYPE_TAG)?;
        check_len(delta.len(), step.output.len())?;
        if !want_input_delta {
            return Ok(None);
        }
        if step.mask.is_empty() {
            return Ok(Some(delta.to_vec()));
        }
        Ok(Some(delta.iter().zip(&step.mask).map(|(d, m)| d * m).collect()))
    }

    fn last_output(&self) -> Option<(&[f32], usize)> {
        self.history.last().map(|s| (s.output.as_slice(), s.batch_size))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            self.history.clear();
        }
        self.mode = mode;
    }

    fn clear_history(&mut self) {
        self.history.clear();
    }

    fn export_state(&self, writer: &mut ModelWriter<'_>) -> Result<()> {
        writer.write_shape(self.shape)?;
        writer.write_shape(self.shape)?;
        writer.write_f32(self.drop_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(rate: f32, size: usize) -> DropoutLayer {
        let mut layer = DropoutLayer::new(rate).unwrap();
        layer.bind(Shape::flat(size), &mut BindContext::with_seed(42)).unwrap();
        layer
    }

    #[test]
    fn test_dropout_invalid_rate() {
        assert!(DropoutLayer::new(1.0).is_err());
        assert!(DropoutLayer::new(-0.1).is_err());
    }

    #[test]
    fn test_dropout_zero_rate_is_identity() {
        let mut layer = bound(0.0, 8);
        let input: Vec<f32> = (0..8).map(|i| i as f32).collect();
        assert_eq!(layer.forward(&input, 1).unwrap(), input);
    }

    #[test]
    fn test_dropout_mask_and_scaling() {
        let mut layer = bound(0.5, 1000);
        let input = vec![1.0f32; 1000];
        let out = layer.forward(&input, 1).unwrap();
        assert!(out.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = out.iter().filter(|&&v| v == 2.0).count();
        assert!(kept > 400 && kept < 600, "kept {} of 1000", kept);

        // Backward routes the delta through the same mask
        let delta = layer.backward(&vec![1.0; 1000], true).unwrap().unwrap();
        assert_eq!(delta, out);
    }

    #[test]
    fn test_dropout_inert_in_gradient_check_mode() {
        let mut layer = bound(0.9, 16);
        layer.set_mode(Mode::GradientCheck);
        let input = vec![0.5f32; 32];
        assert_eq!(layer.forward(&input, 2).unwrap(), input);
        assert_eq!(layer.backward(&input, true).unwrap().unwrap(), input);
    }

    #[test]
    fn test_dropout_deterministic_for_seed() {
        let mut a = bound(0.3, 64);
        let mut b = bound(0.3, 64);
        let input = vec![1.0f32; 64];
        assert_eq!(a.forward(&input, 1).unwrap(), b.forward(&input, 1).unwrap());
    }
}
