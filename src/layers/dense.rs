//! Dense (fully connected) layer implementation
//!
//! This module provides a DenseLayer (also known as Linear or Fully Connected layer)
//! that performs the transformation: output = activation(input × Wᵀ + biases)

use crate::backend::BackendHandle;
use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{not_bound, pop_step, record_step, BindContext, Initializer, Layer, Mode, Parameter};
use crate::optimizers::OptimizerKind;
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::{buffer_len, Shape};
use crate::utils::Activation;

pub const TYPE_TAG: &str = "dense";

/// Dense (fully connected) layer with weights and biases.
///
/// Performs the transformation `y = f(x Wᵀ + b)` where x is the input
/// (batch_size × input_size), W is the weight matrix
/// (output_size × input_size) and b is the bias vector (output_size).
///
/// Any input shape is accepted and read as a flat vector of
/// `shape.size()` features; the output shape is always flat.
///
/// # Example
///
/// ```
/// use rust_neural_engine::layers::{BindContext, DenseLayer, Layer};
/// use rust_neural_engine::tensor::Shape;
/// use rust_neural_engine::utils::Activation;
///
/// let mut ctx = BindContext::with_seed(42);
/// let mut layer = DenseLayer::new(3, Activation::Relu);
/// let out = layer.bind(Shape::flat(4), &mut ctx).unwrap();
/// assert_eq!(out, Shape::flat(3));
/// assert_eq!(layer.parameter_count(), 4 * 3 + 3);
/// ```
pub struct DenseLayer {
    output_size: usize,
    activation: Activation,
    initializer: Initializer,
    optimizer: Option<OptimizerKind>,
    input_shape: Shape,
    state: Option<DenseState>,
    mode: Mode,
    history: Vec<DenseStep>,
}

struct DenseState {
    weights: Parameter,
    biases: Parameter,
    backend: BackendHandle,
}

struct DenseStep {
    input: Vec<f32>,
    output: Vec<f32>,
    batch_size: usize,
}

impl DenseLayer {
    /// Create an unbound layer producing `output_size` features.
    ///
    /// Weights are Xavier-initialized at bind time, biases start at zero.
    pub fn new(output_size: usize, activation: Activation) -> Self {
        Self {
            output_size,
            activation,
            initializer: Initializer::default(),
            optimizer: None,
            input_shape: Shape::flat(0),
            state: None,
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    /// Overrides the model-wide optimizer kind for this layer.
    pub fn with_optimizer(mut self, kind: OptimizerKind) -> Self {
        self.optimizer = Some(kind);
        self
    }

    /// Get the input size of the layer.
    pub fn input_size(&self) -> usize {
        self.input_shape.size()
    }

    /// Get the output size of the layer.
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Weight matrix, row-major `[output_size × input_size]`.
    pub fn weights(&self) -> Option<&[f32]> {
        self.state.as_ref().map(|s| s.weights.values())
    }

    pub fn biases(&self) -> Option<&[f32]> {
        self.state.as_ref().map(|s| s.biases.values())
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let output_size = reader.read_usize()?;
        let initializer = Initializer::from_tag(&reader.read_str()?)?;
        let activation = Activation::from_tag(&reader.read_str()?)?;
        let kind = OptimizerKind::from_tag(&reader.read_str()?)?;

        let mut layer = DenseLayer::new(output_size, activation)
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
        let (n_in, n_out) = (self.input_shape.size(), self.output_size);
        check_len(delta.len(), batch_size * n_out)?;
        let state = self.state.as_mut().ok_or_else(|| not_bound(TYPE_TAG))?;

        // Bias gradient: column sums of the delta
        let bias_grad = state.biases.gradients_mut();
        for row in delta.chunks_exact(n_out) {
            for (g, &d) in bias_grad.iter_mut().zip(row) {
                *g += d;
            }
        }

        // Weight gradient: deltaᵀ · input, accumulated over the batch
        let (_, weight_grad) = state.weights.split_mut();
        if batch_size == 1 {
            state.backend.outer_product(delta, &step.input, weight_grad);
        } else {
            state.backend.multiply(
                true, false, n_out, n_in, batch_size, delta, &step.input, weight_grad, true,
            );
        }

        if !want_input_delta {
            return Ok(None);
        }
        let mut input_delta = vec![0.0f32; batch_size * n_in];
        state.backend.multiply(
            false,
            false,
            batch_size,
            n_in,
            n_out,
            delta,
            state.weights.values(),
            &mut input_delta,
            false,
        );
        Ok(Some(input_delta))
    }
}

impl Layer for DenseLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        if self.output_size == 0 {
            return Err(NetworkError::InvalidShape(
                "dense output size must be positive".to_string(),
            ));
        }
        let (n_in, n_out) = (input.size(), self.output_size);
        let kind = ctx.optimizer_kind(self.optimizer);
        let n_weights = buffer_len(&[n_in, n_out])?;
        let weights = self.initializer.sample(n_weights, n_in, n_out, &mut ctx.rng);
        self.state = Some(DenseState {
            weights: ctx.parameter("weights", weights, kind),
            biases: ctx.parameter("biases", vec![0.0; n_out], kind),
            backend: ctx.backend.clone(),
        });
        self.optimizer = Some(kind);
        self.input_shape = input;
        self.history.clear();
        log::debug!("dense: {} -> {}", input, n_out);
        Ok(Shape::flat(n_out))
    }

    fn input_shape(&self) -> Shape {
        self.input_shape
    }

    fn output_shape(&self) -> Shape {
        Shape::flat(self.output_size)
    }

    fn forward(&mut self, input: &[f32], batch_size: usize) -> Result<Vec<f32>> {
        check_batch(batch_size)?;
        let (n_in, n_out) = (self.input_shape.size(), self.output_size);
        check_len(input.len(), batch_size * n_in)?;
        let state = self.state.as_ref().ok_or_else(|| not_bound(TYPE_TAG))?;

        let mut output = vec![0.0f32; batch_size * n_out];
        for row in output.chunks_exact_mut(n_out) {
            row.copy_from_slice(state.biases.values());
        }
        state.backend.multiply(
            false,
            true,
            batch_size,
            n_out,
            n_in,
            input,
            state.weights.values(),
            &mut output,
            true,
        );
        self.activation.apply(&mut output, batch_size);

        record_step(
            &mut self.history,
            self.mode,
            DenseStep {
                input: input.to_vec(),
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
        writer.write_shape(self.output_shape())?;
        writer.write_usize(self.output_size)?;
        writer.write_str(self.initializer.tag())?;
        writer.write_str(self.activation.tag())?;
        writer.write_str(self.optimizer.unwrap_or_default().tag())?;
        for parameter in self.parameters() {
            parameter.export(writer)?;
        }
        Ok(())
    }
}
