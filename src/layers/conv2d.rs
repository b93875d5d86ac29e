//! 2D Convolutional layer implementation
//!
//! This module provides a Conv2DLayer for direct (non-FFT) 2D convolution
//! with zero padding, stride and dilation. Data layout is NCHW.

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{not_bound, pop_step, record_step, BindContext, Initializer, Layer, Mode, Parameter};
use crate::optimizers::OptimizerKind;
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::{buffer_len, pad, unpad, Shape};
use crate::utils::Activation;
use rayon::prelude::*;

pub const TYPE_TAG: &str = "convolution";

/// 2D Convolutional layer.
///
/// Each of the `filters` kernels spans all input channels. With input
/// `(C, H, W)`, padding `P`, stride `S` and dilation `D`, the effective
/// kernel extent is `E = D * (K - 1) + 1` and the output is
/// `(filters, (H + 2P - E) / S + 1, (W + 2P - E) / S + 1)` (floor division).
///
/// # Weight Layout
///
/// Weights are stored as `[filters, in_channels, kernel, kernel]`, biases
/// as one value per filter.
///
/// # Example
///
/// ```
/// use rust_neural_engine::layers::{BindContext, Conv2DLayer, Layer};
/// use rust_neural_engine::tensor::Shape;
/// use rust_neural_engine::utils::Activation;
///
/// let mut ctx = BindContext::with_seed(42);
/// let mut conv = Conv2DLayer::new(8, 3, 1, 1, Activation::Relu);
/// let out = conv.bind(Shape::new(1, 28, 28), &mut ctx).unwrap();
/// assert_eq!(out, Shape::new(8, 28, 28));
/// ```
pub struct Conv2DLayer {
    filters: usize,
    kernel_size: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
    activation: Activation,
    initializer: Initializer,
    optimizer: Option<OptimizerKind>,
    input_shape: Shape,
    output_shape: Shape,
    state: Option<ConvState>,
    mode: Mode,
    history: Vec<ConvStep>,
}

struct ConvState {
    weights: Parameter,
    biases: Parameter,
}

struct ConvStep {
    padded_input: Vec<f32>,
    output: Vec<f32>,
    batch_size: usize,
}

/// Geometry shared by the forward and backward kernels.
#[derive(Clone, Copy)]
struct Geometry {
    channels: usize,
    padded_h: usize,
    padded_w: usize,
    filters: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    out_h: usize,
    out_w: usize,
}

impl Geometry {
    fn kernel_len(&self) -> usize {
        self.channels * self.kernel * self.kernel
    }

    fn padded_plane(&self) -> usize {
        self.padded_h * self.padded_w
    }

    fn out_plane(&self) -> usize {
        self.out_h * self.out_w
    }
}

impl Conv2DLayer {
    /// Create an unbound convolution with dilation 1.
    ///
    /// # Arguments
    ///
    /// * `filters` - Number of output channels
    /// * `kernel_size` - Side of the square kernel
    /// * `stride` - Step between output positions
    /// * `padding` - Zero rows/columns added on every side
    /// * `activation` - Output activation
    pub fn new(
        filters: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        activation: Activation,
    ) -> Self {
        Self {
            filters,
            kernel_size,
            stride,
            padding,
            dilation: 1,
            activation,
            initializer: Initializer::default(),
            optimizer: None,
            input_shape: Shape::flat(0),
            output_shape: Shape::flat(0),
            state: None,
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn with_optimizer(mut self, kind: OptimizerKind) -> Self {
        self.optimizer = Some(kind);
        self
    }

    pub fn filters(&self) -> usize {
        self.filters
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn padding(&self) -> usize {
        self.padding
    }

    pub fn dilation(&self) -> usize {
        self.dilation
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            channels: self.input_shape.channels,
            padded_h: self.input_shape.height + 2 * self.padding,
            padded_w: self.input_shape.width + 2 * self.padding,
            filters: self.filters,
            kernel: self.kernel_size,
            stride: self.stride,
            dilation: self.dilation,
            out_h: self.output_shape.height,
            out_w: self.output_shape.width,
        }
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let filters = reader.read_usize()?;
        let kernel_size = reader.read_usize()?;
        let stride = reader.read_usize()?;
        let padding = reader.read_usize()?;
        let dilation = reader.read_usize()?;
        let initializer = Initializer::from_tag(&reader.read_str()?)?;
        let activation = Activation::from_tag(&reader.read_str()?)?;
        let kind = OptimizerKind::from_tag(&reader.read_str()?)?;

        let mut layer = Conv2DLayer::new(filters, kernel_size, stride, padding, activation)
            .with_dilation(dilation)
            .with_initializer(initializer)
            .with_optimizer(kind);
        let rebuilt = layer.bind(input, ctx).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        for parameter in layer.parameters_mut() {
            parameter.import(reader)?;
        }
        Ok(layer)
    }

    fn apply_backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        let step = pop_step(&mut self.history, TYPE_TAG)?;
        let batch_size = step.batch_size;
        check_len(delta.len(), batch_size * self.output_shape.size())?;
        let g = self.geometry();
        let state = self.state.as_mut().ok_or_else(|| not_bound(TYPE_TAG))?;
        let padded = &step.padded_input;

        // One task per filter: it owns that filter's bias slot and kernel block.
        let (weights, weight_grad) = state.weights.split_mut();
        state
            .biases
            .gradients_mut()
            .par_iter_mut()
            .zip(weight_grad.par_chunks_mut(g.kernel_len()))
            .enumerate()
            .for_each(|(f, (bias_grad, kernel_grad))| {
                for b in 0..batch_size {
                    let plane = &delta[(b * g.filters + f) * g.out_plane()..][..g.out_plane()];
                    *bias_grad += plane.iter().sum::<f32>();
                    for c in 0..g.channels {
                        let input_plane =
                            &padded[(b * g.channels + c) * g.padded_plane()..][..g.padded_plane()];
                        for kh in 0..g.kernel {
                            for kw in 0..g.kernel {
                                let mut acc = 0.0f32;
                                for oh in 0..g.out_h {
                                    let ih = oh * g.stride + kh * g.dilation;
                                    let row = &input_plane[ih * g.padded_w..];
                                    for ow in 0..g.out_w {
                                        let iw = ow * g.stride + kw * g.dilation;
                                        acc += plane[oh * g.out_w + ow] * row[iw];
                                    }
                                }
                                kernel_grad[(c * g.kernel + kh) * g.kernel + kw] += acc;
                            }
                        }
                    }
                }
            });

        if !want_input_delta {
            return Ok(None);
        }

        // Transposed correlation into the padded frame, one task per (b, c) plane.
        let mut padded_delta = vec![0.0f32; batch_size * g.channels * g.padded_plane()];
        padded_delta
            .par_chunks_mut(g.padded_plane())
            .enumerate()
            .for_each(|(plane_index, out_plane)| {
                let b = plane_index / g.channels;
                let c = plane_index % g.channels;
                for f in 0..g.filters {
                    let delta_plane = &delta[(b * g.filters + f) * g.out_plane()..][..g.out_plane()];
                    let kernel = &weights[(f * g.channels + c) * g.kernel * g.kernel..];
                    for oh in 0..g.out_h {
                        for ow in 0..g.out_w {
                            let d = delta_plane[oh * g.out_w + ow];
                            if d == 0.0 {
                                continue;
                            }
                            for kh in 0..g.kernel {
                                let ih = oh * g.stride + kh * g.dilation;
                                for kw in 0..g.kernel {
                                    let iw = ow * g.stride + kw * g.dilation;
                                    out_plane[ih * g.padded_w + iw] += d * kernel[kh * g.kernel + kw];
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
            self.padding,
            self.padding,
        )))
    }
}

impl Layer for Conv2DLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        if self.filters == 0 || self.kernel_size == 0 || self.stride == 0 || self.dilation == 0 {
            return Err(NetworkError::InvalidShape(format!(
                "convolution needs positive filters/kernel/stride/dilation, got {}/{}/{}/{}",
                self.filters, self.kernel_size, self.stride, self.dilation
            )));
        }
        let extent = buffer_len(&[self.dilation, self.kernel_size - 1])? + 1;
        let padded_h = input.height + 2 * self.padding;
        let padded_w = input.width + 2 * self.padding;
        Shape::new(input.channels, padded_h, padded_w).validate()?;
        if extent > padded_h || extent > padded_w {
            return Err(NetworkError::InvalidShape(format!(
                "kernel extent {} exceeds padded input {}x{}",
                extent, padded_h, padded_w
            )));
        }
        let output = Shape::new(
            self.filters,
            (padded_h - extent) / self.stride + 1,
            (padded_w - extent) / self.stride + 1,
        );
        output.validate()?;

        let kernel_area = self.kernel_size * self.kernel_size;
        let fan_in = input.channels * kernel_area;
        let fan_out = self.filters * kernel_area;
        let kind = ctx.optimizer_kind(self.optimizer);
        let n_weights = buffer_len(&[self.filters, input.channels, self.kernel_size, self.kernel_size])?;
        let weights = self
            .initializer
            .sample(n_weights, fan_in, fan_out, &mut ctx.rng);
        self.state = Some(ConvState {
            weights: ctx.parameter("filters", weights, kind),
            biases: ctx.parameter("biases", vec![0.0; self.filters], kind),
        });
        self.optimizer = Some(kind);
        self.input_shape = input;
        self.output_shape = output;
        self.history.clear();
        log::debug!("convolution: {} -> {}", input, output);
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
        let state = self.state.as_ref().ok_or_else(|| not_bound(TYPE_TAG))?;
        let g = self.geometry();
        let padded = pad(input, batch_size, self.input_shape, self.padding, self.padding, 0.0);
        let weights = state.weights.values();
        let biases = state.biases.values();

        let mut output = vec![0.0f32; batch_size * self.output_shape.size()];
        output
            .par_chunks_mut(g.out_plane())
            .enumerate()
            .for_each(|(plane_index, out_plane)| {
                let b = plane_index / g.filters;
                let f = plane_index % g.filters;
                out_plane.iter_mut().for_each(|v| *v = biases[f]);
                for c in 0..g.channels {
                    let input_plane = &padded[(b * g.channels + c) * g.padded_plane()..][..g.padded_plane()];
                    let kernel = &weights[(f * g.channels + c) * g.kernel * g.kernel..];
                    for kh in 0..g.kernel {
                        for kw in 0..g.kernel {
                            let w = kernel[kh * g.kernel + kw];
                            for oh in 0..g.out_h {
                                let row = &input_plane[(oh * g.stride + kh * g.dilation) * g.padded_w..];
                                let out_row = &mut out_plane[oh * g.out_w..(oh + 1) * g.out_w];
                                for (ow, out) in out_row.iter_mut().enumerate() {
                                    *out += w * row[ow * g.stride + kw * g.dilation];
                                }
                            }
                        }
                    }
                }
            });
        self.activation.apply(&mut output, batch_size);

        record_step(
            &mut self.history,
            self.mode,
            ConvStep {
                padded_input: padded,
                output: output.clone(),
                batch_size,
            },
        );
        Ok(output)
    }

    fn backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        let step = self.history.last().ok_or_else(|| {
            NetworkError::InvalidState(format!("{}: backward called without a forward pass", TYPE_TAG))
        })?;
        check_len(delta.len(), step.output.len())?;
        let mut pre_activation = delta.to_vec();
        self.activation
            .backward(&step.output, &mut pre_activation, step.batch_size);
        self.apply_backward(&pre_activation, want_input_delta)
    }

    fn backward_pre_activation(
        &mut self,
        delta: &[f32],
        want_input_delta: bool,
    ) -> Result<Option<Vec<f32>>> {
        self.apply_backward(delta, want_input_delta)
    }

    fn activation(&self) -> Activation {
        self.activation
    }

    fn last_output(&self) -> Option<(&[f32], usize)> {
        self.history.last().map(|s| (s.output.as_slice(), s.batch_size))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        match &self.state {
            Some(s) => vec![&s.weights, &s.biases],
            None => Vec::new(),
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        match &mut self.state {
            Some(s) => vec![&mut s.weights, &mut s.biases],
            None => Vec::new(),
        }
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
        writer.write_usize(self.filters)?;
        writer.write_usize(self.kernel_size)?;
        writer.write_usize(self.stride)?;
        writer.write_usize(self.padding)?;
        writer.write_usize(self.dilation)?;
        writer.write_str(self.initializer.tag())?;
        writer.write_str(self.activation.tag())?;
        writer.write_str(self.optimizer.unwrap_or_default().tag())?;
        for parameter in self.parameters() {
            parameter.export(writer)?;
        }
        Ok(())
    }
}
