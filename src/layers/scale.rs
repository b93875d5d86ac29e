//! Learned per-channel affine transform.

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{not_bound, pop_step, record_step, BindContext, Layer, Mode, Parameter};
use crate::optimizers::OptimizerKind;
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::Shape;
use crate::utils::Activation;
use rayon::prelude::*;

pub const TYPE_TAG: &str = "scale";

/// `y = f(γ_c * x + β_c)` with one `γ` (init 1) and `β` (init 0) per channel.
pub struct ScaleLayer {
    activation: Activation,
    optimizer: Option<OptimizerKind>,
    shape: Shape,
    state: Option<ScaleState>,
    mode: Mode,
    history: Vec<ScaleStep>,
}

struct ScaleState {
    gamma: Parameter,
    beta: Parameter,
}

struct ScaleStep {
    input: Vec<f32>,
    output: Vec<f32>,
    batch_size: usize,
}

impl ScaleLayer {
    pub fn new(activation: Activation) -> Self {
        Self {
            activation,
            optimizer: None,
            shape: Shape::flat(0),
            state: None,
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    pub fn with_optimizer(mut self, kind: OptimizerKind) -> Self {
        self.optimizer = Some(kind);
        self
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let activation = Activation::from_tag(&reader.read_str()?)?;
        let kind = OptimizerKind::from_tag(&reader.read_str()?)?;
        let mut layer = ScaleLayer::new(activation).with_optimizer(kind);
        let rebuilt = layer.bind(input, ctx).map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        for parameter in layer.parameters_mut() {
            parameter.import(reader)?;
        }
        Ok(layer)
    }

    fn apply_backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        let step = pop_step(&mut self.history, TYPE_TAG)?;
        check_len(delta.len(), step.input.len())?;
        let channels = self.shape.channels;
        let spatial = self.shape.spatial();
        let state = self.state.as_mut().ok_or_else(|| not_bound(TYPE_TAG))?;

        for (plane_index, (dy, x)) in delta
            .chunks_exact(spatial)
            .zip(step.input.chunks_exact(spatial))
            .enumerate()
        {
            let c = plane_index % channels;
            state.beta.gradients_mut()[c] += dy.iter().sum::<f32>();
            state.gamma.gradients_mut()[c] += dy.iter().zip(x).map(|(d, x)| d * x).sum::<f32>();
        }

        if !want_input_delta {
            return Ok(None);
        }
        let gamma = state.gamma.values();
        let mut input_delta = delta.to_vec();
        input_delta
            .par_chunks_mut(spatial)
            .enumerate()
            .for_each(|(plane_index, plane)| {
                let g = gamma[plane_index % channels];
                plane.iter_mut().for_each(|d| *d *= g);
            });
        Ok(Some(input_delta))
    }
}

impl Layer for ScaleLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        let kind = ctx.optimizer_kind(self.optimizer);
        self.state = Some(ScaleState {
            gamma: ctx.parameter("gamma", vec![1.0; input.channels], kind),
            beta: ctx.parameter("beta", vec![0.0; input.channels], kind),
        });
        self.optimizer = Some(kind);
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
        let state = self.state.as_ref().ok_or_else(|| not_bound(TYPE_TAG))?;
        let gamma = state.gamma.values();
        let beta = state.beta.values();

        let mut output = input.to_vec();
        output
            .par_chunks_mut(spatial)
            .enumerate()
            .for_each(|(plane_index, plane)| {
                let c = plane_index % channels;
                plane.iter_mut().for_each(|v| *v = gamma[c] * *v + beta[c]);
            });
        self.activation.apply(&mut output, batch_size);

        record_step(
            &mut self.history,
            self.mode,
            ScaleStep {
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
        writer.write_shape(self.shape)?;
        writer.write_shape(self.shape)?;
        writer.write_str(self.activation.tag())?;
        writer.write_str(self.optimizer.unwrap_or_default().tag())?;
        for parameter in self.parameters() {
            parameter.export(writer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_starts_as_identity() {
        let mut layer = ScaleLayer::new(Activation::Identity);
        layer.bind(Shape::new(2, 1, 2), &mut BindContext::with_seed(0)).unwrap();
        let input = [1.0, -2.0, 3.0, 0.5];
        assert_eq!(layer.forward(&input, 1).unwrap(), input.to_vec());
    }

    #[test]
    fn test_scale_gradients_per_channel() {
        let mut layer = ScaleLayer::new(Activation::Identity);
        layer.bind(Shape::new(2, 1, 2), &mut BindContext::with_seed(0)).unwrap();
        layer.parameters_mut()[0].values_mut().copy_from_slice(&[2.0, 3.0]);
        layer.forward(&[1.0, 2.0, 3.0, 4.0], 1).unwrap();
        let dx = layer.backward(&[1.0, 1.0, 1.0, 1.0], true).unwrap().unwrap();
        assert_eq!(dx, vec![2.0, 2.0, 3.0, 3.0]);
        let params = layer.parameters();
        assert_eq!(params[0].gradients(), &[3.0, 7.0]);
        assert_eq!(params[1].gradients(), &[2.0, 2.0]);
    }
}
