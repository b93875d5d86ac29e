//! Pyramid pooling block.

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{
    pop_step, record_step, BatchNormLayer, BindContext, Chain, Conv2DLayer, InterpolationLayer,
    Layer, Mode, Parameter, PoolMode, PoolingLayer,
};
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::{add_assign, buffer_len, concat_channels, div_ceil, split_channels, Shape};
use crate::utils::Activation;
use rayon::prelude::*;

pub const TYPE_TAG: &str = "pyramid_pool";

/// Pooling grid sizes of the four branches.
pub const DEFAULT_BINS: [usize; 4] = [1, 2, 3, 6];

/// Pyramid scene pooling.
///
/// Each branch average-pools the input to roughly `bin x bin` cells
/// (window = stride = `ceil(H / bin)` per axis), projects to `filters`
/// channels with a `1x1` convolution, normalizes with BN(relu) and
/// upsamples back to `H x W` bilinearly. The output is the input followed
/// by every branch output along the channel axis.
pub struct PyramidPoolLayer {
    filters: usize,
    bins: Vec<usize>,
    branches: Vec<Chain>,
    input_shape: Shape,
    output_shape: Shape,
    mode: Mode,
    history: Vec<PyramidStep>,
}

struct PyramidStep {
    output: Vec<f32>,
    batch_size: usize,
}

impl PyramidPoolLayer {
    pub fn new(filters: usize) -> Self {
        Self::with_bins(filters, DEFAULT_BINS.to_vec())
    }

    pub fn with_bins(filters: usize, bins: Vec<usize>) -> Self {
        Self {
            filters,
            bins,
            branches: Vec::new(),
            input_shape: Shape::flat(0),
            output_shape: Shape::flat(0),
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    pub fn bins(&self) -> &[usize] {
        &self.bins
    }

    fn branch(&self, input: Shape, bin: usize) -> Chain {
        let kernel = (div_ceil(input.height, bin), div_ceil(input.width, bin));
        Chain::new(vec![
            Box::new(PoolingLayer::rectangular(PoolMode::Average, kernel, kernel, (0, 0))),
            Box::new(Conv2DLayer::new(self.filters, 1, 1, 0, Activation::Identity)),
            Box::new(BatchNormLayer::new().with_activation(Activation::Relu)),
            Box::new(InterpolationLayer::new(input.height, input.width)),
        ])
    }

    fn channel_split(&self) -> Vec<usize> {
        let mut split = vec![self.input_shape.channels];
        split.extend(std::iter::repeat(self.filters).take(self.branches.len()));
        split
    }

    fn finish_bind(&mut self, input: Shape) -> Result<Shape> {
        for branch in &self.branches {
            let shape = branch.output_shape().unwrap_or(input);
            if shape != Shape::new(self.filters, input.height, input.width) {
                return Err(NetworkError::InvalidShape(format!(
                    "pyramid branch produces {}, expected {}x{}x{}",
                    shape, self.filters, input.height, input.width
                )));
            }
        }
        let pooled = buffer_len(&[self.filters, self.branches.len()])?;
        let output = Shape::new(input.channels + pooled, input.height, input.width);
        output.validate()?;
        self.input_shape = input;
        self.output_shape = output;
        self.history.clear();
        Ok(self.output_shape)
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let filters = reader.read_usize()?;
        let count = reader.read_usize()?;
        let mut bins = Vec::new();
        for _ in 0..count {
            bins.push(reader.read_usize()?);
        }
        let mut layer = PyramidPoolLayer::with_bins(filters, bins);
        for _ in 0..count {
            layer.branches.push(Chain::import(reader, ctx, input)?);
        }
        let rebuilt = layer
            .finish_bind(input)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        Ok(layer)
    }
}

impl Layer for PyramidPoolLayer {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        if self.filters == 0 || self.bins.is_empty() || self.bins.contains(&0) {
            return Err(NetworkError::InvalidShape(format!(
                "pyramid pooling needs positive filters and bins, got {} / {:?}",
                self.filters, self.bins
            )));
        }
        let mut branches = Vec::with_capacity(self.bins.len());
        for &bin in &self.bins {
            let mut chain = self.branch(input, bin);
            chain.bind(input, ctx)?;
            branches.push(chain);
        }
        self.branches = branches;
        let output = self.finish_bind(input)?;
        log::debug!("pyramid pool: {} -> {} (bins {:?})", input, output, self.bins);
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
        let outputs = self
            .branches
            .par_iter_mut()
            .map(|branch| branch.forward(input, batch_size))
            .collect::<Result<Vec<_>>>()?;
        let mut parts: Vec<(&[f32], usize)> = vec![(input, self.input_shape.channels)];
        parts.extend(outputs.iter().map(|o| (o.as_slice(), self.filters)));
        let output = concat_channels(&parts, batch_size, self.input_shape.spatial());

        record_step(
            &mut self.history,
            self.mode,
            PyramidStep {
                output: output.clone(),
                batch_size,
            },
        );
        Ok(output)
    }

    fn backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        let step = pop_step(&mut self.history, TYPE_TAG)?;
        check_len(delta.len(), step.output.len())?;
        let mut deltas = split_channels(
            delta,
            step.batch_size,
            self.input_shape.spatial(),
            &self.channel_split(),
        );
        let branch_deltas = deltas.split_off(1);
        let input_deltas = self
            .branches
            .par_iter_mut()
            .zip(branch_deltas.par_iter())
            .map(|(branch, d)| branch.backward(d, want_input_delta))
            .collect::<Result<Vec<_>>>()?;
        if !want_input_delta {
            return Ok(None);
        }
        // The pass-through slice reaches the input unchanged.
        let mut total = deltas.swap_remove(0);
        for d in input_deltas.into_iter().flatten() {
            add_assign(&mut total, &d);
        }
        Ok(Some(total))
    }

    fn last_output(&self) -> Option<(&[f32], usize)> {
        self.history.last().map(|s| (s.output.as_slice(), s.batch_size))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.branches.iter().flat_map(|b| b.parameters()).collect()
    }

    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.branches.iter_mut().flat_map(|b| b.parameters_mut()).collect()
    }

    fn mode(&self) -> Mode {
        self.mode
    }

    fn set_mode(&mut self, mode: Mode) {
        if self.mode != mode {
            self.history.clear();
        }
        self.mode = mode;
        for branch in self.branches.iter_mut() {
            branch.set_mode(mode);
        }
    }

    fn clear_history(&mut self) {
        self.history.clear();
        for branch in self.branches.iter_mut() {
            branch.clear_history();
        }
    }

    fn export_state(&self, writer: &mut ModelWriter<'_>) -> Result<()> {
        writer.write_shape(self.input_shape)?;
        writer.write_shape(self.output_shape)?;
        writer.write_usize(self.filters)?;
        writer.write_usize(self.bins.len())?;
        for &bin in &self.bins {
            writer.write_usize(bin)?;
        }
        for branch in &self.branches {
            branch.export(writer)?;
        }
        Ok(())
    }
}
