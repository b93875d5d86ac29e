//! Layer trait definition.
//!
//! Every layer variant follows the same lifecycle:
//!
//! 1. It is constructed from hyperparameters only (no shape knowledge).
//! 2. [`Layer::bind`] receives the input shape, allocates parameters and
//!    optimizer state, and returns the output shape.
//! 3. Each training step runs [`Layer::forward`], then [`Layer::backward`]
//!    (or [`Layer::backward_from_cost`] for the terminal layer), then
//!    [`Layer::update`].
//!
//! Forward caches are kept in a time-ordered history: each forward pushes
//! one entry and each backward pops the most recent one, so `T` forwards
//! followed by `T` backwards is backward-through-time for any stack.

use crate::cost::Cost;
use crate::error::{NetworkError, Result};
use crate::layers::{BindContext, Mode, Parameter};
use crate::serialization::ModelWriter;
use crate::tensor::Shape;
use crate::utils::Activation;

/// Core trait for neural network layers.
///
/// # Example
///
/// ```ignore
/// let out_shape = layer.bind(Shape::flat(4), &mut ctx)?;
/// let output = layer.forward(&input, batch_size)?;
/// let input_delta = layer.backward(&delta, true)?;
/// layer.update(batch_size as f32);
/// ```
pub trait Layer: Send {
    /// Serialization tag of the variant.
    fn type_tag(&self) -> &'static str;

    /// Materializes parameters for `input` and returns the output shape.
    ///
    /// Fails with `InvalidShape` when the input violates the variant's
    /// arity or geometry constraints.
    fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape>;

    fn input_shape(&self) -> Shape;

    fn output_shape(&self) -> Shape;

    /// Forward propagation for `batch_size` stacked examples.
    fn forward(&mut self, input: &[f32], batch_size: usize) -> Result<Vec<f32>>;

    /// Backward propagation of a delta w.r.t. this layer's output.
    ///
    /// Accumulates parameter gradients and, when `want_input_delta` is set,
    /// returns the delta w.r.t. the input of the matching forward call.
    fn backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>>;

    /// Like [`Layer::backward`] but `delta` is already taken w.r.t. the
    /// pre-activation. Layers without an activation treat both the same.
    fn backward_pre_activation(
        &mut self,
        delta: &[f32],
        want_input_delta: bool,
    ) -> Result<Option<Vec<f32>>> {
        self.backward(delta, want_input_delta)
    }

    /// Output activation; the terminal layer's activation decides the cost
    /// derivative form.
    fn activation(&self) -> Activation {
        Activation::Identity
    }

    /// Output and batch size of the most recent un-consumed forward call.
    fn last_output(&self) -> Option<(&[f32], usize)>;

    /// Terminal-layer entry: derives the delta from `cost` and `targets`,
    /// then runs the backward pass.
    fn backward_from_cost(&mut self, cost: Cost, targets: &[f32]) -> Result<Vec<f32>> {
        let delta = {
            let (output, batch_size) = self.last_output().ok_or_else(|| {
                NetworkError::InvalidState(format!(
                    "{}: backward_from_cost called without a forward pass",
                    self.type_tag()
                ))
            })?;
            cost.derivative(output, targets, self.activation(), batch_size)?
        };
        self.backward_pre_activation(&delta, true)?.ok_or_else(|| {
            NetworkError::InvalidState(format!("{}: no input delta produced", self.type_tag()))
        })
    }

    fn parameters(&self) -> Vec<&Parameter>;

    fn parameters_mut(&mut self) -> Vec<&mut Parameter>;

    fn parameter_count(&self) -> usize {
        self.parameters().iter().map(|p| p.len()).sum()
    }

    fn zero_gradients(&mut self) {
        for parameter in self.parameters_mut() {
            parameter.zero_gradients();
        }
    }

    /// Applies one optimizer step using gradients divided by `batch_scale`,
    /// then clears gradients and the forward history.
    fn update(&mut self, batch_scale: f32) {
        for parameter in self.parameters_mut() {
            parameter.apply_update(batch_scale);
        }
        self.clear_history();
    }

    fn mode(&self) -> Mode;

    /// Switches mode; a change of mode clears the forward history.
    fn set_mode(&mut self, mode: Mode);

    /// Drops cached forward steps (and any carried recurrent state).
    fn clear_history(&mut self);

    /// Writes shape, hyperparameters and parameters (without the type tag).
    fn export_state(&self, writer: &mut ModelWriter<'_>) -> Result<()>;

    /// One-line description used by model summaries.
    fn describe(&self) -> String {
        format!(
            "{:<14} {} -> {} ({} params)",
            self.type_tag(),
            self.input_shape(),
            self.output_shape(),
            self.parameter_count()
        )
    }
}
