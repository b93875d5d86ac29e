//! Batch Normalization layer implementation
//!
//! This module provides a channel-wise BatchNormLayer that normalizes each
//! channel over the batch and spatial positions, then applies a learned
//! scale (gamma) and shift (beta) followed by an optional activation.

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{not_bound, pop_step, record_step, BindContext, Layer, Mode, Parameter};
use crate::optimizers::OptimizerKind;
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::Shape;
use crate::utils::Activation;
use rayon::prelude::*;

pub const TYPE_TAG: &str = "batch_norm";

pub const DEFAULT_EPSILON: f32 = 1e-5;
pub const DEFAULT_MOMENTUM: f32 = 0.9;

/// Batch Normalization layer.
///
/// For every channel `c`, with `N = batch_size * H * W` samples:
///
/// ```text
/// x̂ = (x - μ_c) / sqrt(σ²_c + ε)
/// y = f(γ_c * x̂ + β_c)
/// ```
///
/// `Train` and `GradientCheck` use the batch statistics; only `Train`
/// folds them into the running statistics
/// (`running = momentum * running + (1 - momentum) * batch`). `Eval` uses
/// the running statistics, which makes the layer an affine map.
///
/// # Example
///
/// ```
/// use rust_neural_engine::layers::{BatchNormLayer, BindContext, Layer};
/// use rust_neural_engine::tensor::Shape;
///
/// let mut bn = BatchNormLayer::new();
/// bn.bind(Shape::new(3, 4, 4), &mut BindContext::with_seed(1)).unwrap();
/// assert_eq!(bn.parameter_count(), 6);
/// ```
pub struct BatchNormLayer {
    epsilon: f32,
    momentum: f32,
    activation: Activation,
    optimizer: Option<OptimizerKind>,
    shape: Shape,
    state: Option<BatchNormState>,
    mode: Mode,
    history: Vec<BatchNormStep>,
}

struct BatchNormState {
    gamma: Parameter,
    beta: Parameter,
    running_mean: Vec<f32>,
    running_var: Vec<f32>,
}

struct BatchNormStep {
    normalized: Vec<f32>,
    inv_std: Vec<f32>,
    batch_statistics: bool,
    output: Vec<f32>,
    batch_size: usize,
}

impl Default for BatchNormLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchNormLayer {
    pub fn new() -> Self {
        Self {
            epsilon: DEFAULT_EPSILON,
            momentum: DEFAULT_MOMENTUM,
            activation: Activation::Identity,
            optimizer: None,
            shape: Shape::flat(0),
            state: None,
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    /// Sets epsilon (must be positive) and momentum (in `[0, 1)`).
    pub fn with_hyperparameters(mut self, epsilon: f32, momentum: f32) -> Result<Self> {
        if epsilon <= 0.0 {
            return Err(NetworkError::Config(format!(
                "batch norm epsilon must be positive, got {}",
                epsilon
            )));
        }
        if !(0.0..1.0).contains(&momentum) {
            return Err(NetworkError::Config(format!(
                "batch norm momentum must be in [0, 1), got {}",
                momentum
            )));
        }
        self.epsilon = epsilon;
        self.momentum = momentum;
        Ok(self)
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_optimizer(mut self, kind: OptimizerKind) -> Self {
        self.optimizer = Some(kind);
        self
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn running_mean(&self) -> Option<&[f32]> {
        self.state.as_ref().map(|s| s.running_mean.as_slice())
    }

    pub fn running_var(&self) -> Option<&[f32]> {
        self.state.as_ref().map(|s| s.running_var.as_slice())
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let epsilon = reader.read_f32()?;
        let momentum = reader.read_f32()?;
        let activation = Activation::from_tag(&reader.read_str()?)?;
        let kind = OptimizerKind::from_tag(&reader.read_str()?)?;

        let mut layer = BatchNormLayer::new()
            .with_hyperparameters(epsilon, momentum)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?
            .with_activation(activation)
            .with_optimizer(kind);
        let rebuilt = layer.bind(input, ctx).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        for parameter in layer.parameters_mut() {
            parameter.import(reader)?;
        }
        let state = layer.state.as_mut().ok_or_else(|| not_bound(TYPE_TAG))?;
        reader.read_values_into(&mut state.running_mean)?;
        reader.read_values_into(&mut state.running_var)?;
        Ok(layer)
    }

    fn apply_backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        let step = pop_step(&mut self.history, TYPE_TAG)?;
        check_len(delta.len(), step.normalized.len())?;
        let state = self.state.as_mut().ok_or_else(|| not_bound(TYPE_TAG))?;
        let channels = self.shape.channels;
        let spatial = self.shape.spatial();
        let batch_size = step.batch_size;
        let count = (batch_size * spatial) as f32;

        // Per-channel sums of dy and dy * x̂, one task per channel.
        let sums: Vec<(f32, f32)> = (0..channels)
            .into_par_iter()
            .map(|c| {
                let mut sum_dy = 0.0f32;
                let mut sum_dy_xhat = 0.0f32;
                for b in 0..batch_size {
                    let start = (b * channels + c) * spatial;
                    for i in start..start + spatial {
                        sum_dy += delta[i];
                        sum_dy_xhat += delta[i] * step.normalized[i];
                    }
                }
                (sum_dy, sum_dy_xhat)
            })
            .collect();

        for (c, &(sum_dy, sum_dy_xhat)) in sums.iter().enumerate() {
            state.beta.gradients_mut()[c] += sum_dy;
            state.gamma.gradients_mut()[c] += sum_dy_xhat;
        }

        if !want_input_delta {
            return Ok(None);
        }
        let gamma = state.gamma.values();
        let mut input_delta = vec![0.0f32; delta.len()];
        input_delta
            .par_chunks_mut(spatial)
            .enumerate()
            .for_each(|(plane_index, plane)| {
                let c = plane_index % channels;
                let scale = gamma[c] * step.inv_std[c];
                let start = plane_index * spatial;
                let (sum_dy, sum_dy_xhat) = sums[c];
                for (i, dx) in plane.iter_mut().enumerate() {
                    let dy = delta[start + i];
                    *dx = if step.batch_statistics {
                        let xhat = step.normalized[start + i];
                        scale * (dy - sum_dy / count - xhat * sum_dy_xhat / count)
                    } else {
                        scale * dy
                    };
                }
            });
        Ok(Some(input_delta))
    }
}

impl Layer for BatchNormLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        let channels = input.channels;
        let kind = ctx.optimizer_kind(self.optimizer);
        self.state = Some(BatchNormState {
            gamma: ctx.parameter("gamma", vec![1.0; channels], kind),
            beta: ctx.parameter("beta", vec![0.0; channels], kind),
            running_mean: vec![0.0; channels],
            running_var: vec![1.0; channels],
        });
        self.optimizer = Some(kind);
        self.shape = input;
        self.history.clear();
        log::debug!(
            "batch norm: {} ({} {})",
            input,
            channels,
            if input.is_flat() { "features" } else { "channels" }
        );
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
        let epsilon = self.epsilon;
        let momentum = self.momentum;
        let batch_statistics = self.mode != Mode::Eval;
        let state = self.state.as_mut().ok_or_else(|| not_bound(TYPE_TAG))?;

        let (mean, var): (Vec<f32>, Vec<f32>) = if batch_statistics {
            let count = (batch_size * spatial) as f64;
            (0..channels)
                .into_par_iter()
                .map(|c| {
                    let mut sum = 0.0f64;
                    let mut sum_sq = 0.0f64;
                    for b in 0..batch_size {
                        let start = (b * channels + c) * spatial;
                        for &x in &input[start..start + spatial] {
                            sum += x as f64;
                            sum_sq += (x as f64) * (x as f64);
                        }
                    }
                    let mean = sum / count;
                    let var = (sum_sq / count - mean * mean).max(0.0);
                    (mean as f32, var as f32)
                })
                .unzip()
        } else {
            (state.running_mean.clone(), state.running_var.clone())
        };

        if self.mode == Mode::Train {
            for c in 0..channels {
                state.running_mean[c] = momentum * state.running_mean[c] + (1.0 - momentum) * mean[c];
                state.running_var[c] = momentum * state.running_var[c] + (1.0 - momentum) * var[c];
            }
        }

        let inv_std: Vec<f32> = var.iter().map(|v| 1.0 / (v + epsilon).sqrt()).collect();
        let gamma = state.gamma.values();
        let beta = state.beta.values();
        let mut normalized = vec![0.0f32; input.len()];
        let mut output = vec![0.0f32; input.len()];
        normalized
            .par_chunks_mut(spatial)
            .zip(output.par_chunks_mut(spatial))
            .enumerate()
            .for_each(|(plane_index, (xhat, out))| {
                let c = plane_index % channels;
                let source = &input[plane_index * spatial..(plane_index + 1) * spatial];
                for ((n, y), &x) in xhat.iter_mut().zip(out.iter_mut()).zip(source) {
                    *n = (x - mean[c]) * inv_std[c];
                    *y = gamma[c] * *n + beta[c];
                }
            });
        self.activation.apply(&mut output, batch_size);

        record_step(
            &mut self.history,
            self.mode,
            BatchNormStep {
                normalized,
                inv_std,
                batch_statistics,
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
            Some(s) => vec![&s.gamma, &s.beta],
            None => Vec::new(),
        }
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        match &mut self.state {
            Some(s) => vec![&mut s.gamma, &mut s.beta],
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
        let state = self.state.as_ref().ok_or_else(|| not_bound(TYPE_TAG))?;
        writer.write_shape(self.shape)?;
        writer.write_shape(self.shape)?;
        writer.write_f32(self.epsilon)?;
        writer.write_f32(self.momentum)?;
        writer.write_str(self.activation.tag())?;
        writer.write_str(self.optimizer.unwrap_or_default().tag())?;
        state.gamma.export(writer)?;
        state.beta.export(writer)?;
        writer.write_values(&state.running_mean)?;
        writer.write_values(&state.running_var)
    }
}
