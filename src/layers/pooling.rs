//! Spatial pooling layer (max and average).

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{pop_step, record_step, BindContext, Layer, Mode, Parameter};
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::{div_ceil, pad, unpad, Shape};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const TYPE_TAG: &str = "pooling";

/// Pooling reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolMode {
    Max,
    Average,
}

impl PoolMode {
    pub fn tag(&self) -> &'static str {
        match self {
            PoolMode::Max => "max",
            PoolMode::Average => "average",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "max" => Ok(PoolMode::Max),
            "average" => Ok(PoolMode::Average),
            other => Err(NetworkError::Serialization(format!(
                "unknown pooling mode '{}'",
                other
            ))),
        }
    }
}

/// Max or average pooling over (optionally overlapping) windows.
///
/// Output size per axis, with padded extent `Hp = H + 2P`:
///
/// ```text
/// Ho = 1                             if Hp <= K
/// Ho = ceil((Hp - K) / S) + 1        otherwise
/// ```
///
/// minus one when the last window would start past the real input. Windows
/// that run past the padded edge are clamped; average pooling divides by
/// the clamped window area in both directions. Max pooling remembers the
/// selected input position per output ("switch") and routes the delta
/// back to it, accumulating where windows overlap.
pub struct PoolingLayer {
    pool: PoolMode,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_shape: Shape,
    output_shape: Shape,
    mode: Mode,
    history: Vec<PoolStep>,
}

struct PoolStep {
    switches: Vec<usize>,
    output: Vec<f32>,
    batch_size: usize,
}

fn pooled_extent(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    let padded = input + 2 * padding;
    if padded <= kernel {
        return 1;
    }
    let mut out = div_ceil(padded - kernel, stride) + 1;
    if (out - 1) * stride >= input + padding {
        out -= 1;
    }
    out
}

impl PoolingLayer {
    /// Square window of side `size`.
    pub fn new(pool: PoolMode, size: usize, stride: usize, padding: usize) -> Self {
        Self::rectangular(pool, (size, size), (stride, stride), (padding, padding))
    }

    /// Independent `(height, width)` window, stride and padding.
    pub fn rectangular(
        pool: PoolMode,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Self {
        Self {
            pool,
            kernel,
            stride,
            padding,
            input_shape: Shape::flat(0),
            output_shape: Shape::flat(0),
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    pub fn pool_mode(&self) -> PoolMode {
        self.pool
    }

    fn padded_shape(&self) -> Shape {
        Shape::new(
            self.input_shape.channels,
            self.input_shape.height + 2 * self.padding.0,
            self.input_shape.width + 2 * self.padding.1,
        )
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let pool = PoolMode::from_tag(&reader.read_str()?)?;
        let kernel = (reader.read_usize()?, reader.read_usize()?);
        let stride = (reader.read_usize()?, reader.read_usize()?);
        let padding = (reader.read_usize()?, reader.read_usize()?);
        let mut layer = PoolingLayer::rectangular(pool, kernel, stride, padding);
        let rebuilt = layer.bind(input, ctx).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        Ok(layer)
    }
}

impl Layer for PoolingLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, _ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let (ph, pw) = self.padding;
        if kh == 0 || kw == 0 || sh == 0 || sw == 0 {
            return Err(NetworkError::InvalidShape(
                "pooling window and stride must be positive".to_string(),
            ));
        }
        if ph >= kh || pw >= kw {
            return Err(NetworkError::InvalidShape(format!(
                "pooling padding {}x{} must be smaller than the window {}x{}",
                ph, pw, kh, kw
            )));
        }
        let output = Shape::new(
            input.channels,
            pooled_extent(input.height, kh, sh, ph),
            pooled_extent(input.width, kw, sw, pw),
        );
        output.validate()?;
        Shape::new(input.channels, input.height + 2 * ph, input.width + 2 * pw).validate()?;
        self.input_shape = input;
        self.output_shape = output;
        self.history.clear();
        log::debug!("pooling ({}): {} -> {}", self.pool.tag(), input, output);
        Ok(output)
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        self.output_shape
    }

    fn forward(&mut self, input: &[f32], batch_size: usize) -> Result<Vec<f32>> {
        check_batch(batch_size)?;
        check_len(input.len(), batch_size * self.input_shape.size())?;
        let fill = match self.pool {
            PoolMode::Max => f32::NEG_INFINITY,
            PoolMode::Average => 0.0,
        };
        let padded = pad(input, batch_size, self.input_shape, self.padding.0, self.padding.1, fill);
        let padded_shape = self.padded_shape();
        let (hp, wp) = (padded_shape.height, padded_shape.width);
        let (ho, wo) = (self.output_shape.height, self.output_shape.width);
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let pool = self.pool;
        let in_plane = padded_shape.spatial();
        let out_plane = self.output_shape.spatial();

        let mut output = vec![0.0f32; batch_size * self.output_shape.size()];
        let mut switches = vec![0usize; output.len()];
        output
            .par_chunks_mut(out_plane)
            .zip(switches.par_chunks_mut(out_plane))
            .enumerate()
            .for_each(|(plane_index, (out, switch))| {
                let plane = &padded[plane_index * in_plane..(plane_index + 1) * in_plane];
                for oh in 0..ho {
                    let h0 = oh * sh;
                    let h1 = (h0 + kh).min(hp);
                    for ow in 0..wo {
                        let w0 = ow * sw;
                        let w1 = (w0 + kw).min(wp);
                        let o = oh * wo + ow;
                        match pool {
                            PoolMode::Max => {
                                let mut best = h0 * wp + w0;
                                for h in h0..h1 {
                                    for w in w0..w1 {
                                        if plane[h * wp + w] > plane[best] {
                                            best = h * wp + w;
                                        }
                                    }
                                }
                                out[o] = plane[best];
                                switch[o] = best;
                            }
                            PoolMode::Average => {
                                let mut sum = 0.0f32;
                                for h in h0..h1 {
                                    sum += plane[h * wp + w0..h * wp + w1].iter().sum::<f32>();
                                }
                                out[o] = sum / ((h1 - h0) * (w1 - w0)) as f32;
                            }
                        }
                    }
                }
            });

        if pool == PoolMode::Average {
            switches.clear();
        }
        record_step(
            &mut self.history,
            self.mode,
            PoolStep {
                switches,
                output: output.clone(),
                batch_size,
            },
        );
        Ok(output)
    }

    fn backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        let step = pop_step(&mut self.history, TYPE_TAG)?;
        let batch_size = step.batch_size;
        check_len(delta.len(), step.output.len())?;
        if !want_input_delta {
            return Ok(None);
        }
        let padded_shape = self.padded_shape();
        let (hp, wp) = (padded_shape.height, padded_shape.width);
        let (ho, wo) = (self.output_shape.height, self.output_shape.width);
        let (kh, kw) = self.kernel;
        let (sh, sw) = self.stride;
        let pool = self.pool;
        let in_plane = padded_shape.spatial();
        let out_plane = self.output_shape.spatial();
        let switches = &step.switches;

        // One task per (b, c) plane; overlapping windows accumulate serially inside it.
        let mut padded_delta = vec![0.0f32; batch_size * padded_shape.size()];
        padded_delta
            .par_chunks_mut(in_plane)
            .enumerate()
            .for_each(|(plane_index, plane)| {
                let d = &delta[plane_index * out_plane..(plane_index + 1) * out_plane];
                match pool {
                    PoolMode::Max => {
                        let s = &switches[plane_index * out_plane..(plane_index + 1) * out_plane];
                        for (&index, &value) in s.iter().zip(d) {
                            plane[index] += value;
                        }
                    }
                    PoolMode::Average => {
                        for oh in 0..ho {
                            let h0 = oh * sh;
                            let h1 = (h0 + kh).min(hp);
                            for ow in 0..wo {
                                let w0 = ow * sw;
                                let w1 = (w0 + kw).min(wp);
                                let share = d[oh * wo + ow] / ((h1 - h0) * (w1 - w0)) as f32;
                                for h in h0..h1 {
                                    for v in &mut plane[h * wp + w0..h * wp + w1] {
                                        *v += share;
                                    }
                                }
                            }
                        }
                    }
                }
            });
        Ok(Some(unpad(
            &padded_delta,
            batch_size,
            self.input_shape,
            self.padding.0,
            self.padding.1,
        )))
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
        writer.write_shape(self.output_shape)?;
        writer.write_str(self.pool.tag())?;
        for value in [
            self.kernel.0,
            self.kernel.1,
            self.stride.0,
            self.stride.1,
            self.padding.0,
            self.padding.1,
        ] {
            writer.write_usize(value)?;
        }
        Ok(())
    }
}
