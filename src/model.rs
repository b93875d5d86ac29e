//! Model orchestration.
//!
//! A [`Model`] owns the top-level layer chain and the cost function. It binds
//! shapes once at build time and then drives every training step: forward
//! through all layers, cost derivative at the tail, backward in strict
//! reverse order, then one optimizer update per layer.

use crate::backend::{default_backend, BackendHandle};
use crate::config::{validate_config, TrainingConfig};
use crate::cost::Cost;
use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{read_layer, BindContext, Chain, Layer, Mode, Parameter};
use crate::optimizers::OptimizerConfig;
use crate::progress::ProgressSink;
use crate::serialization::{ModelReader, ModelWriter};
use crate::tensor::Shape;
use crate::utils::SimpleRng;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::time::Instant;

/// Perturbation applied to each scalar by [`Model::gradient_check`].
pub const GRADIENT_CHECK_EPSILON: f32 = 5e-3;

/// Largest relative L2 distance accepted by a gradient check. Loose because
/// all arithmetic is single precision.
pub const GRADIENT_CHECK_THRESHOLD: f64 = 0.08;

/// One labelled example: input values and target values.
pub type Example = (Vec<f32>, Vec<f32>);

/// Assembles and binds a [`Model`].
///
/// # Example
///
/// ```
/// use rust_neural_engine::{Cost, DenseLayer, ModelBuilder, Shape};
/// use rust_neural_engine::utils::Activation;
///
/// let model = ModelBuilder::new(Shape::flat(4))
///     .layer(DenseLayer::new(8, Activation::Tanh))
///     .layer(DenseLayer::new(3, Activation::Softmax))
///     .cost(Cost::CrossEntropy)
///     .seed(1)
///     .build()
///     .unwrap();
/// assert_eq!(model.output_shape(), Shape::flat(3));
/// ```
pub struct ModelBuilder {
    input: Shape,
    layers: Vec<Box<dyn Layer>>,
    cost: Cost,
    optimizer: OptimizerConfig,
    backend: Option<BackendHandle>,
    seed: u64,
}

impl ModelBuilder {
    pub fn new(input: Shape) -> Self {
        Self {
            input,
            layers: Vec::new(),
            cost: Cost::MeanSquaredError,
            optimizer: OptimizerConfig::default(),
            backend: None,
            seed: 42,
        }
    }

    pub fn layer<L: Layer + 'static>(mut self, layer: L) -> Self {
        self.layers.push(Box::new(layer));
        self
    }

    pub fn boxed_layer(mut self, layer: Box<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn cost(mut self, cost: Cost) -> Self {
        self.cost = cost;
        self
    }

    pub fn optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn backend(mut self, backend: BackendHandle) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Binds every layer top-down.
    ///
    /// # Errors
    ///
    /// `InvalidShape` for an empty stack or any shape a layer rejects,
    /// `UnsupportedCombination` when the cost cannot follow the terminal
    /// activation, `Config` for invalid optimizer hyperparameters.
    pub fn build(self) -> Result<Model> {
        self.input.validate()?;
        self.optimizer.validate()?;
        if self.layers.is_empty() {
            return Err(NetworkError::InvalidShape(
                "a model needs at least one layer".to_string(),
            ));
        }
        let backend = self.backend.unwrap_or_else(default_backend);
        let mut ctx = BindContext::new(backend.clone(), self.optimizer, self.seed);
        let mut layers = Chain::new(self.layers);
        let output = layers.bind(self.input, &mut ctx)?;
        if let Some(last) = layers.layers().last() {
            self.cost.check_activation(last.activation())?;
        }

        let model = Model {
            layers,
            cost: self.cost,
            input_shape: self.input,
            output_shape: output,
            optimizer: self.optimizer,
            backend,
            rng: ctx.rng.fork(),
            mode: Mode::Train,
        };
        log::info!(
            "built model: {} -> {}, {} layers, {} parameters, backend {}",
            model.input_shape,
            model.output_shape,
            model.layers.len(),
            model.parameter_count(),
            model.backend.name()
        );
        Ok(model)
    }
}

/// Outcome of a finite-difference gradient check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradientCheckReport {
    /// `|analytic - numeric| / (|analytic| + |numeric|)` over all parameters.
    pub relative_error: f64,
    pub parameters_checked: usize,
    pub passed: bool,
}

/// An ordered layer stack plus its cost function.
pub struct Model {
    layers: Chain,
    cost: Cost,
    input_shape: Shape,
    output_shape: Shape,
    optimizer: OptimizerConfig,
    backend: BackendHandle,
    rng: SimpleRng,
    mode: Mode,
}

impl Model {
    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    pub fn output_shape(&self) -> Shape {
        self.output_shape
    }

    pub fn cost_function(&self) -> Cost {
        self.cost
    }

    pub fn optimizer_config(&self) -> OptimizerConfig {
        self.optimizer
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        self.layers.layers()
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        self.layers.layers_mut()
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        self.layers.parameters()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.parameter_count()
    }

    /// Target values per example expected by [`Model::backward`].
    pub fn target_size(&self) -> usize {
        self.cost.target_size(self.output_shape.size())
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
        self.layers.set_mode(mode);
    }

    pub fn forward(&mut self, input: &[f32], batch_size: usize) -> Result<Vec<f32>> {
        check_batch(batch_size)?;
        check_len(input.len(), batch_size * self.input_shape.size())?;
        self.layers.forward(input, batch_size)
    }

    /// Total cost of `output` against `targets` over the batch.
    pub fn cost(&self, output: &[f32], targets: &[f32], batch_size: usize) -> Result<f32> {
        self.cost.cost(output, targets, batch_size)
    }

    /// Backward pass for the most recent un-consumed forward call.
    ///
    /// The terminal layer derives its delta from the cost; the first layer
    /// skips its input delta.
    pub fn backward(&mut self, targets: &[f32]) -> Result<()> {
        let cost = self.cost;
        let (last, rest) = self
            .layers
            .layers_mut()
            .split_last_mut()
            .ok_or_else(|| NetworkError::InvalidState("model has no layers".to_string()))?;
        let mut delta = last.backward_from_cost(cost, targets)?;
        for (i, layer) in rest.iter_mut().enumerate().rev() {
            match layer.backward(&delta, i > 0)? {
                Some(next) => delta = next,
                None => break,
            }
        }
        Ok(())
    }

    /// One optimizer step per parameter with gradients divided by `batch_scale`.
    pub fn update(&mut self, batch_scale: f32) {
        self.layers.update(batch_scale);
    }

    pub fn zero_gradients(&mut self) {
        self.layers.zero_gradients();
    }

    /// Drops forward caches and carried recurrent state.
    pub fn clear_history(&mut self) {
        self.layers.clear_history();
    }

    /// Forward, backward and update for one batch. Returns the total cost.
    pub fn train_batch(&mut self, inputs: &[f32], targets: &[f32], batch_size: usize) -> Result<f32> {
        self.zero_gradients();
        let output = self.forward(inputs, batch_size)?;
        let cost = self.cost(&output, targets, batch_size)?;
        self.backward(targets)?;
        self.update(batch_size as f32);
        Ok(cost)
    }

    /// Backward-through-time over `inputs.len()` timesteps.
    ///
    /// Runs one forward per timestep, then one backward per timestep in
    /// reverse order, then a single update. Returns the cost summed over
    /// all timesteps.
    pub fn train_sequence(
        &mut self,
        inputs: &[Vec<f32>],
        targets: &[Vec<f32>],
        batch_size: usize,
    ) -> Result<f32> {
        check_sequence(inputs, targets)?;
        self.zero_gradients();
        let mut total = 0.0f32;
        for (input, target) in inputs.iter().zip(targets) {
            let output = self.forward(input, batch_size)?;
            total += self.cost(&output, target, batch_size)?;
        }
        for target in targets.iter().rev() {
            self.backward(target)?;
        }
        self.update(batch_size as f32);
        Ok(total)
    }

    /// Mini-batch training over `dataset`.
    ///
    /// Example order is reshuffled every epoch and the last batch may be
    /// short. Every batch reports its mean per-example cost to `progress`.
    /// When `checkpoint_interval` is set the model is saved to
    /// `checkpoint_name` every that many batches; a failed save is logged
    /// and training continues. Returns the mean per-example cost of the
    /// final epoch.
    pub fn train(
        &mut self,
        dataset: &[Example],
        config: &TrainingConfig,
        progress: &mut dyn ProgressSink,
    ) -> Result<f32> {
        validate_config(config)?;
        if dataset.is_empty() {
            return Err(NetworkError::Config("training dataset is empty".to_string()));
        }
        let input_size = self.input_shape.size();
        let target_size = self.target_size();
        for (input, target) in dataset {
            check_len(input.len(), input_size)?;
            check_len(target.len(), target_size)?;
        }

        let previous = self.mode;
        self.set_mode(Mode::Train);
        log::info!(
            "training: {} examples, epochs={} batch={} lr={}",
            dataset.len(),
            config.epochs,
            config.batch_size,
            self.optimizer.learning_rate
        );

        let mut indices: Vec<usize> = (0..dataset.len()).collect();
        let mut batch_inputs = Vec::with_capacity(config.batch_size * input_size);
        let mut batch_targets = Vec::with_capacity(config.batch_size * target_size);
        let mut step = 0usize;
        let mut epoch_cost = 0.0f32;

        for epoch in 0..config.epochs {
            let start_time = Instant::now();
            self.rng.shuffle(&mut indices);
            let mut total = 0.0f64;

            for chunk in indices.chunks(config.batch_size) {
                batch_inputs.clear();
                batch_targets.clear();
                for &i in chunk {
                    batch_inputs.extend_from_slice(&dataset[i].0);
                    batch_targets.extend_from_slice(&dataset[i].1);
                }
                let cost = self.train_batch(&batch_inputs, &batch_targets, chunk.len())?;
                total += f64::from(cost);
                step += 1;
                progress.record(step, cost / chunk.len() as f32);
                self.maybe_checkpoint(step, config);
            }

            epoch_cost = (total / dataset.len() as f64) as f32;
            log::info!(
                "epoch {} | cost={:.6} | time={:.3}s",
                epoch + 1,
                epoch_cost,
                start_time.elapsed().as_secs_f32()
            );
        }

        progress.finish();
        self.set_mode(previous);
        Ok(epoch_cost)
    }

    fn maybe_checkpoint(&self, step: usize, config: &TrainingConfig) {
        let (Some(interval), Some(path)) = (config.checkpoint_interval, &config.checkpoint_name)
        else {
            return;
        };
        if step % interval != 0 {
            return;
        }
        match self.save(path) {
            Ok(()) => log::info!("checkpoint after batch {} written to {}", step, path),
            Err(e) => log::warn!("checkpoint after batch {} failed: {}", step, e),
        }
    }

    /// Compares analytic gradients with centered finite differences for a
    /// single batch.
    pub fn gradient_check(
        &mut self,
        input: &[f32],
        target: &[f32],
        batch_size: usize,
    ) -> Result<GradientCheckReport> {
        self.gradient_check_sequence(&[input.to_vec()], &[target.to_vec()], batch_size)
    }

    /// Gradient check through a whole unrolled sequence.
    ///
    /// Runs in `GradientCheck` mode (dropout inert, no running-statistic
    /// updates, recurrent state starting from a fixed constant) and
    /// restores the previous mode afterwards. Parameters are left exactly
    /// as they were and no optimizer step is taken.
    pub fn gradient_check_sequence(
        &mut self,
        inputs: &[Vec<f32>],
        targets: &[Vec<f32>],
        batch_size: usize,
    ) -> Result<GradientCheckReport> {
        check_sequence(inputs, targets)?;
        let previous = self.mode;
        self.set_mode(Mode::GradientCheck);
        let report = self.run_gradient_check(inputs, targets, batch_size);
        self.clear_history();
        self.zero_gradients();
        self.set_mode(previous);
        report
    }

    fn run_gradient_check(
        &mut self,
        inputs: &[Vec<f32>],
        targets: &[Vec<f32>],
        batch_size: usize,
    ) -> Result<GradientCheckReport> {
        self.clear_history();
        self.zero_gradients();
        for input in inputs {
            self.forward(input, batch_size)?;
        }
        for target in targets.iter().rev() {
            self.backward(target)?;
        }
        let analytic: Vec<Vec<f32>> = self
            .layers
            .parameters()
            .iter()
            .map(|p| p.gradients().to_vec())
            .collect();
        self.zero_gradients();

        let mut diff_sq = 0.0f64;
        let mut analytic_sq = 0.0f64;
        let mut numeric_sq = 0.0f64;
        let mut checked = 0usize;
        let eps = GRADIENT_CHECK_EPSILON;

        for (p, grads) in analytic.iter().enumerate() {
            for (j, &a) in grads.iter().enumerate() {
                let original = self.perturb(p, j, None)?;
                self.perturb(p, j, Some(original + eps))?;
                let plus = self.sequence_cost(inputs, targets, batch_size)?;
                self.perturb(p, j, Some(original - eps))?;
                let minus = self.sequence_cost(inputs, targets, batch_size)?;
                self.perturb(p, j, Some(original))?;

                let numeric = (plus - minus) / (2.0 * f64::from(eps));
                let a = f64::from(a);
                diff_sq += (a - numeric) * (a - numeric);
                analytic_sq += a * a;
                numeric_sq += numeric * numeric;
                checked += 1;
            }
        }

        let denominator = analytic_sq.sqrt() + numeric_sq.sqrt();
        let relative_error = if denominator > 0.0 {
            diff_sq.sqrt() / denominator
        } else {
            0.0
        };
        let passed = relative_error < GRADIENT_CHECK_THRESHOLD;
        log::info!(
            "gradient check: {} scalars, relative error {:.6} ({})",
            checked,
            relative_error,
            if passed { "pass" } else { "FAIL" }
        );
        Ok(GradientCheckReport {
            relative_error,
            parameters_checked: checked,
            passed,
        })
    }

    /// Reads scalar `j` of parameter `p`, optionally overwriting it first.
    fn perturb(&mut self, p: usize, j: usize, value: Option<f32>) -> Result<f32> {
        let mut params = self.layers.parameters_mut();
        let slot = params
            .get_mut(p)
            .and_then(|param| param.values_mut().get_mut(j))
            .ok_or_else(|| {
                NetworkError::InvalidState(format!("parameter {}[{}] vanished during check", p, j))
            })?;
        if let Some(v) = value {
            *slot = v;
        }
        Ok(*slot)
    }

    fn sequence_cost(
        &mut self,
        inputs: &[Vec<f32>],
        targets: &[Vec<f32>],
        batch_size: usize,
    ) -> Result<f64> {
        self.clear_history();
        let mut total = 0.0f64;
        for (input, target) in inputs.iter().zip(targets) {
            let output = self.forward(input, batch_size)?;
            total += f64::from(self.cost(&output, target, batch_size)?);
        }
        self.clear_history();
        Ok(total)
    }

    /// Writes the layer count, every tagged layer record and the cost tag.
    pub fn export(&self, writer: &mut dyn Write) -> Result<()> {
        let mut writer = ModelWriter::new(writer);
        self.layers.export(&mut writer)?;
        writer.write_str(self.cost.tag())
    }

    /// Rebuilds a model written by [`Model::export`].
    ///
    /// Optimizer hyperparameters are not part of the file; `optimizer`
    /// supplies them while the per-parameter optimizer state is restored.
    /// Any failure is a `Serialization` error and nothing is returned.
    pub fn import(
        reader: &mut dyn Read,
        optimizer: OptimizerConfig,
        backend: BackendHandle,
    ) -> Result<Model> {
        let mut reader = ModelReader::new(reader);
        let mut ctx = BindContext::new(backend.clone(), optimizer, 0);
        let count = reader.read_usize()?;
        if count == 0 {
            return Err(NetworkError::Serialization(
                "model file holds no layers".to_string(),
            ));
        }
        let mut layers = Vec::new();
        for _ in 0..count {
            layers.push(read_layer(&mut reader, &mut ctx)?);
        }
        let cost = Cost::from_tag(&reader.read_str()?)?;
        let input_shape = layers[0].input_shape();
        let layers = Chain::from_bound(layers, input_shape)?;
        let output_shape = layers.output_shape().unwrap_or(input_shape);
        if let Some(last) = layers.layers().last() {
            cost.check_activation(last.activation())
                .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        }
        log::debug!("imported model: {} -> {}, {} layers", input_shape, output_shape, count);
        Ok(Model {
            layers,
            cost,
            input_shape,
            output_shape,
            optimizer,
            backend,
            rng: ctx.rng.fork(),
            mode: Mode::Train,
        })
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.export(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Loads a model file with the default backend.
    pub fn load<P: AsRef<Path>>(path: P, optimizer: OptimizerConfig) -> Result<Model> {
        let file = File::open(path)
            .map_err(|e| NetworkError::Serialization(format!("cannot open model file: {}", e)))?;
        let mut reader = BufReader::new(file);
        Model::import(&mut reader, optimizer, default_backend())
    }

    /// Human-readable layer table.
    pub fn summary(&self) -> String {
        let mut lines: Vec<String> = self.layers.layers().iter().map(|l| l.describe()).collect();
        lines.push(format!(
            "cost {}, {} parameters",
            self.cost.tag(),
            self.parameter_count()
        ));
        lines.join("\n")
    }
}

fn check_sequence(inputs: &[Vec<f32>], targets: &[Vec<f32>]) -> Result<()> {
    if inputs.is_empty() {
        return Err(NetworkError::InvalidState("empty sequence".to_string()));
    }
    check_len(targets.len(), inputs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::DenseLayer;
    use crate::optimizers::OptimizerKind;
    use crate::utils::Activation;

    fn small_model(cost: Cost, last: Activation) -> Model {
        ModelBuilder::new(Shape::flat(3))
            .layer(DenseLayer::new(4, Activation::Sigmoid))
            .layer(DenseLayer::new(2, last))
            .cost(cost)
            .optimizer(OptimizerConfig::new(OptimizerKind::Sgd, 0.1))
            .seed(3)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_softmax_with_mse() {
        let result = ModelBuilder::new(Shape::flat(2))
            .layer(DenseLayer::new(2, Activation::Softmax))
            .cost(Cost::MeanSquaredError)
            .build();
        assert!(matches!(result, Err(NetworkError::UnsupportedCombination(_))));
    }

    #[test]
    fn test_build_rejects_empty_stack() {
        let result = ModelBuilder::new(Shape::flat(2)).build();
        assert!(matches!(result, Err(NetworkError::InvalidShape(_))));
    }

    #[test]
    fn test_forward_checks_input_length() {
        let mut model = small_model(Cost::MeanSquaredError, Activation::Sigmoid);
        assert!(matches!(
            model.forward(&[0.0; 5], 2),
            Err(NetworkError::DimensionMismatch { expected: 6, actual: 5 })
        ));
        assert!(matches!(
            model.forward(&[], 0),
            Err(NetworkError::InvalidBatchSize(0))
        ));
    }

    #[test]
    fn test_train_batch_reduces_cost() {
        let mut model = small_model(Cost::MeanSquaredError, Activation::Sigmoid);
        let input = [0.5, -0.25, 1.0];
        let target = [1.0, 0.0];
        let first = model.train_batch(&input, &target, 1).unwrap();
        let mut last = first;
        for _ in 0..50 {
            last = model.train_batch(&input, &target, 1).unwrap();
        }
        assert!(last < first);
    }

    #[test]
    fn test_gradient_check_passes_and_restores_mode() {
        let mut model = small_model(Cost::CrossEntropy, Activation::Softmax);
        model.set_mode(Mode::Eval);
        let report = model
            .gradient_check(&[0.1, 0.2, -0.3, 0.4, -0.5, 0.6], &[1.0, 0.0, 0.0, 1.0], 2)
            .unwrap();
        assert!(report.passed, "relative error {}", report.relative_error);
        assert_eq!(report.parameters_checked, model.parameter_count());
        assert_eq!(model.mode(), Mode::Eval);
    }

    #[test]
    fn test_summary_lists_layers() {
        let model = small_model(Cost::MeanSquaredError, Activation::Sigmoid);
        let summary = model.summary();
        assert_eq!(summary.lines().count(), 3);
        assert!(summary.contains("dense"));
        assert!(summary.contains("26 parameters"));
    }
}
