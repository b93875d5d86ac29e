//! Bottleneck residual block.

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{
    pop_step, record_step, BatchNormLayer, BindContext, Chain, Conv2DLayer, Layer, Mode, Parameter,
};
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::Shape;
use crate::utils::Activation;

pub const TYPE_TAG: &str = "residual";

/// `relu(main(x) + skip(x))`.
///
/// The main branch is `1x1 conv -> BN(relu) -> 3x3 conv (stride s) ->
/// BN(relu) -> 1x1 conv -> BN`. The skip branch is the identity when the
/// block keeps channels and resolution, otherwise a `1x1` stride-`s`
/// projection convolution followed by BN.
pub struct ResidualLayer {
    bottleneck: usize,
    out_channels: usize,
    stride: usize,
    main: Chain,
    skip: Chain,
    input_shape: Shape,
    output_shape: Shape,
    mode: Mode,
    history: Vec<ResidualStep>,
}

struct ResidualStep {
    output: Vec<f32>,
    batch_size: usize,
}

impl ResidualLayer {
    pub fn new(bottleneck: usize, out_channels: usize, stride: usize) -> Self {
        Self {
            bottleneck,
            out_channels,
            stride,
            main: Chain::identity(),
            skip: Chain::identity(),
            input_shape: Shape::flat(0),
            output_shape: Shape::flat(0),
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    /// True when the skip branch is a projection rather than the identity.
    pub fn has_projection(&self) -> bool {
        !self.skip.is_empty()
    }

    fn main_branch(&self) -> Chain {
        let bn = |activation| -> Box<dyn Layer> {
            Box::new(BatchNormLayer::new().with_activation(activation))
        };
        Chain::new(vec![
            Box::new(Conv2DLayer::new(self.bottleneck, 1, 1, 0, Activation::Identity)),
            bn(Activation::Relu),
            Box::new(Conv2DLayer::new(self.bottleneck, 3, self.stride, 1, Activation::Identity)),
            bn(Activation::Relu),
            Box::new(Conv2DLayer::new(self.out_channels, 1, 1, 0, Activation::Identity)),
            bn(Activation::Identity),
        ])
    }

    fn check_branches(&mut self, input: Shape, main: Shape, skip: Shape) -> Result<Shape> {
        if main != skip {
            return Err(NetworkError::InvalidShape(format!(
                "residual branches disagree: main {} vs skip {}",
                main, skip
            )));
        }
        self.input_shape = input;
        self.output_shape = main;
        self.history.clear();
        Ok(main)
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let bottleneck = reader.read_usize()?;
        let out_channels = reader.read_usize()?;
        let stride = reader.read_usize()?;
        let mut layer = ResidualLayer::new(bottleneck, out_channels, stride);
        layer.main = Chain::import(reader, ctx, input)?;
        layer.skip = Chain::import(reader, ctx, input)?;
        let main = layer.main.output_shape().unwrap_or(input);
        let skip = layer.skip.output_shape().unwrap_or(input);
        let rebuilt = layer
            .check_branches(input, main, skip)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        Ok(layer)
    }
}

impl Layer for ResidualLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        if self.bottleneck == 0 || self.out_channels == 0 || self.stride == 0 {
            return Err(NetworkError::InvalidShape(
                "residual block needs positive channels and stride".to_string(),
            ));
        }
        self.main = self.main_branch();
        self.skip = if input.channels == self.out_channels && self.stride == 1 {
            Chain::identity()
        } else {
            Chain::new(vec![
                Box::new(Conv2DLayer::new(self.out_channels, 1, self.stride, 0, Activation::Identity)),
                Box::new(BatchNormLayer::new()),
            ])
        };
        let main = self.main.bind(input, ctx)?;
        let skip = self.skip.bind(input, ctx)?;
        let output = self.check_branches(input, main, skip)?;
        log::debug!(
            "residual: {} -> {} ({})",
            input,
            output,
            if self.has_projection() { "projection" } else { "identity" }
        );
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
        let (main, skip) = rayon::join(
            || self.main.forward(input, batch_size),
            || self.skip.forward(input, batch_size),
        );
        let mut output = main?;
        for (o, s) in output.iter_mut().zip(skip?) {
            *o = (*o + s).max(0.0);
        }

        record_step(
            &mut self.history,
            self.mode,
            ResidualStep {
                output: output.clone(),
                batch_size,
            },
        );
        Ok(output)
    }

    fn backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        let step = pop_step(&mut self.history, TYPE_TAG)?;
        check_len(delta.len(), step.output.len())?;
        let mut summed = delta.to_vec();
        Activation::Relu.backward(&step.output, &mut summed, step.batch_size);

        let (main, skip) = rayon::join(
            || self.main.backward(&summed, want_input_delta),
            || self.skip.backward(&summed, want_input_delta),
        );
        match (main?, skip?) {
            (Some(mut total), Some(skip_delta)) => {
                for (t, s) in total.iter_mut().zip(skip_delta) {
                    *t += s;
                }
                Ok(Some(total))
            }
            _ => Ok(None),
        }
    }

    fn last_output(&self) -> Option<(&[f32], usize)> {
        self.history.last().map(|s| (s.output.as_slice(), s.batch_size))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.main.parameters();
        params.extend(self.skip.parameters());
        params
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut params = self.main.parameters_mut();
        params.extend(self.skip.parameters_mut());
        params
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            self.history.clear();
        }
        self.mode = mode;
        self.main.set_mode(mode);
        self.skip.set_mode(mode);
    }

    fn clear_history(&mut self) {
        self.history.clear();
        self.main.clear_history();
        self.skip.clear_history();
    }

    fn export_state(&self, writer: &mut ModelWriter<'_>) -> Result<()> {
        writer.write_shape(self.input_shape)?;
        writer.write_shape(self.output_shape)?;
        writer.write_usize(self.bottleneck)?;
        writer.write_usize(self.out_channels)?;
        writer.write_usize(self.stride)?;
        self.main.export(writer)?;
        self.skip.export(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_skip_when_shape_kept() {
        let mut block = ResidualLayer::new(2, 4, 1);
        let out = block.bind(Shape::new(4, 5, 5), &mut BindContext::with_seed(2)).unwrap();
        assert_eq!(out, Shape::new(4, 5, 5));
        assert!(!block.has_projection());
    }

    #[test]
    fn test_projection_skip_on_stride() {
        let mut block = ResidualLayer::new(2, 8, 2);
        let out = block.bind(Shape::new(4, 5, 5), &mut BindContext::with_seed(2)).unwrap();
        assert_eq!(out, Shape::new(8, 3, 3));
        assert!(block.has_projection());
        // main: 4*2+2, bn 4, 2*2*9+2, bn 4, 2*8+8, bn 16; skip: 4*8+8, bn 16
        assert_eq!(block.parameter_count(), 10 + 4 + 38 + 4 + 24 + 16 + 40 + 16);
    }

    #[test]
    fn test_output_is_non_negative() {
        let mut block = ResidualLayer::new(2, 3, 1);
        block.bind(Shape::new(3, 3, 3), &mut BindContext::with_seed(4)).unwrap();
        let input: Vec<f32> = (0..54).map(|i| ((i * 7) % 11) as f32 / 5.0 - 1.0).collect();
        let out = block.forward(&input, 2).unwrap();
        assert!(out.iter().all(|&v| v >= 0.0));
        let dx = block.backward(&vec![1.0; 54], true).unwrap().unwrap();
        assert_eq!(dx.len(), 54);
    }
}
