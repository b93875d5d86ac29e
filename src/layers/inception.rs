//! Multi-branch channel concatenation (inception-style block).

use crate::error::{check_batch, check_len, NetworkError, Result};
use crate::layers::{
    pop_step, record_step, BindContext, Chain, Conv2DLayer, Layer, Mode, Parameter, PoolMode,
    PoolingLayer,
};
use crate::serialization::{expect_shape, ModelReader, ModelWriter};
use crate::tensor::{add_assign, concat_channels, split_channels, Shape};
use crate::utils::Activation;
use rayon::prelude::*;

pub const TYPE_TAG: &str = "multi_branch_concat";

/// Runs independent branches on the same input and concatenates their
/// outputs along the channel axis in declaration order.
///
/// Backward splits the delta along the same channel boundaries and sums
/// the branch input deltas, since every branch reads the same input.
/// Branches may run in parallel; the concatenation order never changes.
pub struct MultiBranchConcat {
    branches: Vec<Chain>,
    branch_channels: Vec<usize>,
    input_shape: Shape,
    output_shape: Shape,
    mode: Mode,
    history: Vec<ConcatStep>,
}

struct ConcatStep {
    output: Vec<f32>,
    batch_size: usize,
}

/// Channel counts of the classic four-branch inception block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InceptionFilters {
    pub conv1x1: usize,
    pub reduce3x3: usize,
    pub conv3x3: usize,
    pub reduce5x5: usize,
    pub conv5x5: usize,
}

impl MultiBranchConcat {
    pub fn new(branches: Vec<Chain>) -> Self {
        Self {
            branches,
            branch_channels: Vec::new(),
            input_shape: Shape::flat(0),
            output_shape: Shape::flat(0),
            mode: Mode::Train,
            history: Vec::new(),
        }
    }

    /// Four branches: `1x1`, `1x1 -> 3x3`, `1x1 -> 5x5` and a `3x3`
    /// stride-1 max pool, all spatial-size preserving, ReLU after every
    /// convolution.
    pub fn inception(filters: InceptionFilters) -> Self {
        let conv = |n, k, p| -> Box<dyn Layer> {
            Box::new(Conv2DLayer::new(n, k, 1, p, Activation::Relu))
        };
        Self::new(vec![
            Chain::new(vec![conv(filters.conv1x1, 1, 0)]),
            Chain::new(vec![conv(filters.reduce3x3, 1, 0), conv(filters.conv3x3, 3, 1)]),
            Chain::new(vec![conv(filters.reduce5x5, 1, 0), conv(filters.conv5x5, 5, 2)]),
            Chain::new(vec![Box::new(PoolingLayer::new(PoolMode::Max, 3, 1, 1))]),
        ])
    }

    pub fn branches(&self) -> &[Chain] {
        &self.branches
    }

    fn finish_bind(&mut self, input: Shape, shapes: Vec<Shape>) -> Result<Shape> {
        let first = shapes.first().copied().ok_or_else(|| {
            NetworkError::InvalidShape("multi-branch block needs at least one branch".to_string())
        })?;
        if let Some(bad) = shapes
            .iter()
            .find(|s| s.height != first.height || s.width != first.width)
        {
            return Err(NetworkError::InvalidShape(format!(
                "branch outputs disagree on spatial size: {} vs {}",
                first, bad
            )));
        }
        let channels = shapes
            .iter()
            .try_fold(0usize, |acc, s| acc.checked_add(s.channels))
            .ok_or_else(|| NetworkError::InvalidShape("branch channels overflow".to_string()))?;
        let output = Shape::new(channels, first.height, first.width);
        output.validate()?;
        self.branch_channels = shapes.iter().map(|s| s.channels).collect();
        self.input_shape = input;
        self.output_shape = output;
        self.history.clear();
        Ok(self.output_shape)
    }

    pub(crate) fn import(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Self> {
        let input = reader.read_shape()?;
        let output = reader.read_shape()?;
        let count = reader.read_usize()?;
        let mut branches = Vec::new();
        let mut shapes = Vec::new();
        for _ in 0..count {
            let chain = Chain::import(reader, ctx, input)?;
            shapes.push(chain.output_shape().unwrap_or(input));
            branches.push(chain);
        }
        let mut layer = MultiBranchConcat::new(branches);
        let rebuilt = layer
            .finish_bind(input, shapes)
            .map_err(|e| NetworkError::Serialization(e.to_string()))?;
        expect_shape(output, rebuilt, TYPE_TAG)?;
        Ok(layer)
    }
}

impl Layer for MultiBranchConcat {
    fn type_tag(&self) -> &'static str {
        TYPE_TAG
    }

    fn bind(&mut self, input: Shape, ctx: &mut BindContext) -> Result<Shape> {
        input.validate()?;
        let mut shapes = Vec::with_capacity(self.branches.len());
        for branch in self.branches.iter_mut() {
            shapes.push(branch.bind(input, ctx)?);
        }
        let output = self.finish_bind(input, shapes)?;
        log::debug!(
            "multi-branch concat: {} -> {} (branches {:?})",
            input,
            output,
            self.branch_channels
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
        let outputs = self
            .branches
            .par_iter_mut()
            .map(|branch| branch.forward(input, batch_size))
            .collect::<Result<Vec<_>>>()?;
        let parts: Vec<(&[f32], usize)> = outputs
            .iter()
            .zip(&self.branch_channels)
            .map(|(o, &c)| (o.as_slice(), c))
            .collect();
        let output = concat_channels(&parts, batch_size, self.output_shape.spatial());

        record_step(
            &mut self.history,
            self.mode,
            ConcatStep {
                output: output.clone(),
                batch_size,
            },
        );
        Ok(output)
    }

    fn backward(&mut self, delta: &[f32], want_input_delta: bool) -> Result<Option<Vec<f32>>> {
        let step = pop_step(&mut self.history, TYPE_TAG)?;
        check_len(delta.len(), step.output.len())?;
        let deltas = split_channels(
            delta,
            step.batch_size,
            self.output_shape.spatial(),
            &self.branch_channels,
        );
        let input_deltas = self
            .branches
            .par_iter_mut()
            .zip(deltas.par_iter())
            .map(|(branch, d)| branch.backward(d, want_input_delta))
            .collect::<Result<Vec<_>>>()?;
        if !want_input_delta {
            return Ok(None);
        }
        let mut total = vec![0.0f32; step.batch_size * self.input_shape.size()];
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
        writer.write_usize(self.branches.len())?;
        for branch in &self.branches {
            branch.export(writer)?;
        }
        Ok(())
    }
}
