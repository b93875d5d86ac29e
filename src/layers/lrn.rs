//! Local response normalization across channels.

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{pop_step, record_step, BindContext, Layer, Mode, Parameter};
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::Shape;
use rayon::prelude::*;

pub const TYPE_TAG: &str = "lrn";

/// Cross-channel local response normalization.
///
/// For channel `c` at every spatial position:
///
/// ```text
/// s_c = k + (α / n) * Σ_{c' ∈ [c - n/2, c + n/2]} x_{c'}²
/// y_c = x_c * s_c^(-β)
/// ```
///
/// The neighborhood is clamped at the first and last channel.
#[derive(Debug)]
pub struct LrnLayer {
    size: usize,
    alpha: f32,
    beta: f32,
    k: f32,
    shape: Shape,
    mode: Mode,
    history: Vec<LrnStep>,
}

#[derive(Debug)]
struct LrnStep {
    input: Vec<f32>,
    scale: Vec<f32>,
    output: Vec<f32>,
    batch_size: usize,
}

impl Default for LrnLayer {
    fn default() -> Self {
        Self::new(5, 1e-4, 0.75, 2.0)
    }
}

impl LrnLayer {
    pub fn new(size: usize, alpha: f32, beta: f32, k: f32) -> Self {
        Self {
            size,
            alpha,
            beta,
            k,
            shape: Shape::flat(0),
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    /// Channels in the normalization window.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn beta(&self) -> f32 {
        self.beta
    }

    pub fn k(&self) -> f32 {
        self.k
    }

    fn window(&self, c: usize) -> std::ops::Range<usize> {
        let half = self.size / 2;
        c.saturating_sub(half)..(c + half + 1).min(self.shape.channels)
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let size = reader.read_usize()?;
        let alpha = reader.read_f32()?;
        let beta = reader.read_f32()?;
        let k = reader.read_f32()?;
        let mut layer = LrnLayer::new(size, alpha, beta, k);
        let rebuilt = layer.bind(input, ctx).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        Ok(layer)
    }
}

impl Layer for LrnLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, _ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        if self.size == 0 || self.k <= 0.0 {
            return Err(NetworkError::InvalidShape(format!(
                "lrn needs a positive window and k, got n={} k={}",
                self.size, self.k
            )));
        }
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
        check_len(input.len(), batch_size * self.shape.size())?;
        let channels = self.shape.channels;
        let spatial = self.shape.spatial();
        let example = self.shape.size();
        let coefficient = self.alpha / self.size as f32;

        let mut scale = vec![0.0f32; input.len()];
        let mut output = vec![0.0f32; input.len()];
        scale
            .par_chunks_mut(example)
            .zip(output.par_chunks_mut(example))
            .zip(input.par_chunks(example))
            .for_each(|((s, y), x)| {
                for c in 0..channels {
                    for p in 0..spatial {
                        let sum_sq: f32 = self
                            .window(c)
                            .map(|n| x[n * spatial + p] * x[n * spatial + p])
                            .sum();
                        let i = c * spatial + p;
                        s[i] = self.k + coefficient * sum_sq;
                        y[i] = x[i] * s[i].powf(-self.beta);
                    }
                }
            });

        record_step(
            &mut self.history,
            self.mode,
            LrnStep {
                input: input.to_vec(),
                scale,
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
        let channels = self.shape.channels;
        let spatial = self.shape.spatial();
        let example = self.shape.size();
        let factor = 2.0 * self.alpha * self.beta / self.size as f32;

        let mut input_delta = vec![0.0f32; delta.len()];
        input_delta
            .par_chunks_mut(example)
            .enumerate()
            .for_each(|(b, dx)| {
                let range = b * example..(b + 1) * example;
                let x = &step.input[range.clone()];
                let s = &step.scale[range.clone()];
                let dy = &delta[range];
                // Windows are symmetric, so j lies in window(c) iff c lies in window(j).
                for j in 0..channels {
                    for p in 0..spatial {
                        let i = j * spatial + p;
                        let cross: f32 = self
                            .window(j)
                            .map(|c| {
                                let n = c * spatial + p;
                                dy[n] * x[n] * s[n].powf(-self.beta - 1.0)
                            })
                            .sum();
                        dx[i] = dy[i] * s[i].powf(-self.beta) - factor * x[i] * cross;
                    }
                }
            });
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
        writer.write_shape(self.shape)?;
        writer.write_usize(self.size)?;
        writer.write_f32(self.alpha)?;
        writer.write_f32(self.beta)?;
        writer.write_f32(self.k)
    }
}
