//! Bilinear spatial resizing.

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{pop_step, record_step, BindContext, Layer, Mode, Parameter};
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::Shape;
use rayon::prelude::*;

pub const TYPE_TAG: &str = "interpolation";

/// Source taps for one output coordinate: `(low, high, weight of high)`.
type Tap = (usize, usize, f32);

fn taps(input: usize, output: usize) -> Vec<Tap> {
    (0..output)
        .map(|o| {
            if input == 1 || output == 1 {
                return (0, 0, 0.0);
            }
            // Corner-aligned: first and last samples coincide.
            let position = o as f32 * (input - 1) as f32 / (output - 1) as f32;
            let low = (position.floor() as usize).min(input - 1);
            let high = (low + 1).min(input - 1);
            (low, high, position - low as f32)
        })
        .collect()
}

/// Resizes every channel plane to `(height, width)` with corner-aligned
/// bilinear interpolation. Backward is the exact transpose of forward.
#[derive(Debug)]
pub struct InterpolationLayer {
    height: usize,
    width: usize,
    input_shape: Shape,
    rows: Vec<Tap>,
    cols: Vec<Tap>,
    mode: Mode,
    history: Vec<InterpolationStep>,
}

#[derive(Debug)]
struct InterpolationStep {
    output: Vec<f32>,
    batch_size: usize,
}

impl InterpolationLayer {
    pub fn new(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            input_shape: Shape::flat(0),
            rows: Vec::new(),
            cols: Vec::new(),
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let mut layer = InterpolationLayer::new(output.height, output.width);
        let rebuilt = layer.bind(input, ctx).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        Ok(layer)
    }
}

impl Layer for InterpolationLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, _ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        let output = Shape::new(input.channels, self.height, self.width);
        output.validate()?;
        self.rows = taps(input.height, self.height);
        self.cols = taps(input.width, self.width);
        self.input_shape = input;
        self.history.clear();
        log::debug!("interpolation: {} -> {}", input, output);
        Ok(output)
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        Shape::new(self.input_shape.channels, self.height, self.width)
    }

    fn forward(&mut self, input: &[f32], batch_size: usize) -> Result<Vec<f32>> {
        check_batch(batch_size)?;
        check_len(input.len(), batch_size * self.input_shape.size())?;
        let in_w = self.input_shape.width;
        let in_plane = self.input_shape.spatial();
        let out_plane = self.height * self.width;
        let (rows, cols) = (&self.rows, &self.cols);

        let mut output = vec![0.0f32; batch_size * self.input_shape.channels * out_plane];
        output
            .par_chunks_mut(out_plane)
            .zip(input.par_chunks(in_plane))
            .for_each(|(out, x)| {
                for (oh, &(h0, h1, fh)) in rows.iter().enumerate() {
                    for (ow, &(w0, w1, fw)) in cols.iter().enumerate() {
                        let top = x[h0 * in_w + w0] * (1.0 - fw) + x[h0 * in_w + w1] * fw;
                        let bottom = x[h1 * in_w + w0] * (1.0 - fw) + x[h1 * in_w + w1] * fw;
                        out[oh * cols.len() + ow] = top * (1.0 - fh) + bottom * fh;
                    }
                }
            });

        record_step(
            &mut self.history,
            self.mode,
            InterpolationStep {
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
        let in_w = self.input_shape.width;
        let in_plane = self.input_shape.spatial();
        let out_plane = self.height * self.width;
        let (rows, cols) = (&self.rows, &self.cols);

        let mut input_delta = vec![0.0f32; step.batch_size * self.input_shape.size()];
        input_delta
            .par_chunks_mut(in_plane)
            .zip(delta.par_chunks(out_plane))
            .for_each(|(dx, dy)| {
                for (oh, &(h0, h1, fh)) in rows.iter().enumerate() {
                    for (ow, &(w0, w1, fw)) in cols.iter().enumerate() {
                        let d = dy[oh * cols.len() + ow];
                        dx[h0 * in_w + w0] += d * (1.0 - fh) * (1.0 - fw);
                        dx[h0 * in_w + w1] += d * (1.0 - fh) * fw;
                        dx[h1 * in_w + w0] += d * fh * (1.0 - fw);
                        dx[h1 * in_w + w1] += d * fh * fw;
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
        writer.write_shape(self.input_shape)?;
        writer.write_shape(self.output_shape())
    }
}
