//! Per-example L2 normalization.

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{pop_step, record_step, BindContext, Layer, Mode, Parameter};
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::Shape;

pub const TYPE_TAG: &str = "l2_norm";

/// Smallest norm used as divisor.
pub const NORM_FLOOR: f32 = 1e-6;

/// Divides each example's flattened vector by `max(‖x‖₂, NORM_FLOOR)`.
#[derive(Debug)]
pub struct L2NormLayer {
    shape: Shape,
    mode: Mode,
    history: Vec<L2Step>,
}

#[derive(Debug)]
struct L2Step {
    norms: Vec<f32>,
    output: Vec<f32>,
    batch_size: usize,
}

impl Default for L2NormLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl L2NormLayer {
    pub fn new() -> Self {
        Self {
            shape: Shape::flat(0),
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let mut layer = L2NormLayer::new();
        let rebuilt = layer.bind(input, ctx).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        Ok(layer)
    }
}

impl Layer for L2NormLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, _ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        self.shape = input;
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
        let example = self.shape.size();
        check_len(input.len(), batch_size * example)?;

        let mut norms = Vec::with_capacity(batch_size);
        let mut output = Vec::with_capacity(input.len());
        for x in input.chunks_exact(example) {
            let norm = x.iter().map(|v| v * v).sum::<f32>().sqrt().max(NORM_FLOOR);
            output.extend(x.iter().map(|v| v / norm));
            norms.push(norm);
        }

        record_step(
            &mut self.history,
            self.mode,
            L2Step {
                norms,
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
        let example = self.shape.size();
        let mut input_delta = Vec::with_capacity(delta.len());
        for ((dy, y), &norm) in delta
            .chunks_exact(example)
            .zip(step.output.chunks_exact(example))
            .zip(&step.norms)
        {
            if norm <= NORM_FLOOR {
                // Clamped: the divisor is a constant.
                input_delta.extend(dy.iter().map(|d| d / norm));
                continue;
            }
            let dot: f32 = dy.iter().zip(y).map(|(d, y)| d * y).sum();
            input_delta.extend(dy.iter().zip(y).map(|(d, y)| (d - y * dot) / norm));
        }
        Ok(Some(input_delta))
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
        writer.write_shape(self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_l2_output_has_unit_norm() {
        let mut layer = L2NormLayer::new();
        layer.bind(Shape::flat(2), &mut BindContext::with_seed(0)).unwrap();
        let out = layer.forward(&[3.0, 4.0, 0.0, 0.0], 2).unwrap();
        assert_relative_eq!(out[0], 0.6, epsilon = 1e-6);
        assert_relative_eq!(out[1], 0.8, epsilon = 1e-6);
        // zero vector stays zero
        assert_eq!(&out[2..], &[0.0, 0.0]);
    }

    #[test]
    fn test_l2_backward_is_orthogonal_to_output() {
        let mut layer = L2NormLayer::new();
        layer.bind(Shape::flat(2), &mut BindContext::with_seed(0)).unwrap();
        let out = layer.forward(&[3.0, 4.0], 1).unwrap();
        let dx = layer.backward(&[1.0, 1.0], true).unwrap().unwrap();
        let dot: f32 = dx.iter().zip(&out).map(|(a, b)| a * b).sum();
        assert_relative_eq!(dot, 0.0, epsilon = 1e-6);
    }
}
