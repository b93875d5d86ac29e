//! Ordered sub-layer sequence.
//!
//! A [`Chain`] owns its layers outright (`Vec<Box<dyn Layer>>`). It is the
//! body of every composite layer's branch and of the model itself. An empty
//! chain is the identity.

use crate::error::{NetworkError, Result};
use crate::layers::{read_layer, write_layer, BindContext, Layer, Mode, Parameter};
use crate::serialization::{ModelReader, ModelWriter};
use crate::tensor::Shape;
use std::fmt;

#[derive(Default)]
pub struct Chain {
    layers: Vec<Box<dyn Layer>>,
    input_shape: Option<Shape>,
    output_shape: Option<Shape>,
}

impl Chain {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Self {
        Self {
            layers,
            input_shape: None,
            output_shape: None,
        }
    }

    /// The identity chain.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn push(&mut self, layer: Box<dyn Layer>) {
        self.layers.push(layer);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    pub fn input_shape(&self) -> Option<Shape> {
        self.input_shape
    }

    pub fn output_shape(&self) -> Option<Shape> {
        self.output_shape
    }

    /// Binds every layer in order, feeding each output shape to the next.
    pub fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape> {
        let mut shape = input;
        for layer in self.layers.iter_mut() {
            shape = layer.bind(shape, ctx)?;
        }
        self.input_shape = Some(input);
        self.output_shape = Some(shape);
        Ok(shape)
    }

    pub fn forward(&mut self, input: &[f32], batch_size: usize) -> Result<Vec<f32>> {
        let mut layers = self.layers.iter_mut();
        let mut current = match layers.next() {
            Some(first) => first.forward(input, batch_size)?,
            None => return Ok(input.to_vec()),
        };
        for layer in layers {
            current = layer.forward(&current, batch_size)?;
        }
        Ok(current)
    }

    /// Backward through every layer in reverse order. The first layer only
    /// computes an input delta when `want_input_delta` is set.
    pub fn backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        self.backward_impl(delta, want_input_delta, false)
    }

    /// Like [`Chain::backward`] with `delta` taken w.r.t. the last layer's
    /// pre-activation.
    pub fn backward_pre_activation(
        &mut self,
        delta: &[f32],
        want_input_delta: bool,
    ) -> Result<Option<Vec<f32>>> {
        self.backward_impl(delta, want_input_delta, true)
    }

    fn backward_impl(
        &mut self,
        delta: &[f32],
        want_input_delta: bool,
        pre_activation: bool,
    ) -> Result<Option<Vec<f32>>> {
        let last = self.layers.len().saturating_sub(1);
        let mut current = delta.to_vec();
        for (i, layer) in self.layers.iter_mut().enumerate().rev() {
            let want = i > 0 || want_input_delta;
            let next = if pre_activation && i == last {
                layer.backward_pre_activation(&current, want)?
            } else {
                layer.backward(&current, want)?
            };
            match next {
                Some(d) => current = d,
                None if want => {
                    return Err(NetworkError::InvalidState(format!(
                        "{}: no input delta produced",
                        layer.type_tag()
                    )))
                }
                None => return Ok(None),
            }
        }
        Ok(want_input_delta.then_some(current))
    }

    pub fn last_output(&self) -> Option<(&[f32], usize)> {
        self.layers.last().and_then(|l| l.last_output())
    }

    pub fn parameters(&self) -> Vec<&Parameter> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.layers.iter_mut().flat_map(|l| l.parameters_mut()).collect()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.parameter_count()).sum()
    }

    pub fn set_mode(&mut self, mode: Mode) {
        for layer in self.layers.iter_mut() {
            layer.set_mode(mode);
        }
    }

    pub fn clear_history(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.clear_history();
        }
    }

    pub fn zero_gradients(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.zero_gradients();
        }
    }

    pub fn update(&mut self, batch_scale: f32) {
        for layer in self.layers.iter_mut() {
            layer.update(batch_scale);
        }
    }

    /// Layer count followed by each tagged layer record.
    pub fn export(&self, writer: &mut ModelWriter<'_>) -> Result<()> {
        writer.write_usize(self.layers.len())?;
        for layer in &self.layers {
            write_layer(layer.as_ref(), writer)?;
        }
        Ok(())
    }

    /// Reads a chain written by [`Chain::export`] and checks that it starts
    /// at `input` and that consecutive shapes line up.
    pub fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext, input: Shape) -> Result<Self> {
        let count = reader.read_usize()?;
        let mut layers = Vec::new();
        for _ in 0..count {
            layers.push(read_layer(reader, ctx)?);
        }
        Self::from_bound(layers, input)
    }

    /// Adopts layers that are already bound, checking shape continuity.
    pub(crate) fn from_bound(layers: Vec<Box<dyn Layer>>, input: Shape) -> Result<Self> {
        let mut shape = input;
        for layer in &layers {
            if layer.input_shape() != shape {
                return Err(NetworkError::Serialization(format!(
                    "{} expects input {}, previous layer produces {}",
                    layer.type_tag(),
                    layer.input_shape(),
                    shape
                )));
            }
            shape = layer.output_shape();
        }
        Ok(Self {
            layers,
            input_shape: Some(input),
            output_shape: Some(shape),
        })
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.layers.iter().map(|l| l.type_tag()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::DenseLayer;
    use crate::utils::Activation;

    #[test]
    fn test_identity_chain_passes_through() {
        let mut chain = Chain::identity();
        let shape = chain.bind(Shape::new(2, 2, 2), &mut BindContext::with_seed(0)).unwrap();
        assert_eq!(shape, Shape::new(2, 2, 2));
        let input = vec![1.0; 8];
        assert_eq!(chain.forward(&input, 1).unwrap(), input);
        assert_eq!(chain.backward(&input, true).unwrap(), Some(input));
        assert_eq!(chain.backward(&[0.0; 8], false).unwrap(), None);
    }

    #[test]
    fn test_chain_binds_in_order() {
        let mut chain = Chain::new(vec![
            Box::new(DenseLayer::new(4, Activation::Tanh)),
            Box::new(DenseLayer::new(2, Activation::Identity)),
        ]);
        let out = chain.bind(Shape::flat(3), &mut BindContext::with_seed(5)).unwrap();
        assert_eq!(out, Shape::flat(2));
        assert_eq!(chain.parameter_count(), 3 * 4 + 4 + 4 * 2 + 2);

        let y = chain.forward(&[0.1, 0.2, 0.3], 1).unwrap();
        assert_eq!(y.len(), 2);
        let dx = chain.backward(&[1.0, -1.0], true).unwrap().unwrap();
        assert_eq!(dx.len(), 3);
    }
}
