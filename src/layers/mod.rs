//! Layer abstractions for neural networks
//!
//! This module provides the [`Layer`] trait, the shared bind-time context and
//! the layer variants: primitive layers (dense, convolution, pooling,
//! dropout, GRU, normalization, interpolation) and composite layers that
//! own sub-layer chains (multi-branch concatenation, residual block,
//! pyramid pooling).

mod r#trait;
pub mod batchnorm;
pub mod chain;
pub mod conv2d;
pub mod dense;
pub mod dropout;
pub mod gru;
pub mod inception;
pub mod interpolation;
pub mod l2norm;
pub mod lrn;
pub mod parameter;
pub mod pooling;
pub mod pyramid;
pub mod residual;
pub mod scale;

pub use batchnorm::BatchNormLayer;
pub use chain::Chain;
pub use conv2d::Conv2DLayer;
pub use dense::DenseLayer;
pub use dropout::DropoutLayer;
pub use gru::GruLayer;
pub use inception::MultiBranchConcat;
pub use interpolation::InterpolationLayer;
pub use l2norm::L2NormLayer;
pub use lrn::LrnLayer;
pub use parameter::{Initializer, Parameter};
pub use pooling::{PoolMode, PoolingLayer};
pub use pyramid::PyramidPoolLayer;
pub use r#trait::Layer;
pub use residual::ResidualLayer;
pub use scale::ScaleLayer;

use crate::backend::{default_backend, BackendHandle};
use crate::error::{NetworkError, Result};
use crate::optimizers::{OptimizerConfig, OptimizerKind};
use crate::serialization::{ModelReader, ModelWriter};
use crate::utils::SimpleRng;

/// Execution mode.
///
/// - `Train`: dropout active, batch statistics, recurrent state carried.
/// - `Eval`: dropout inert, running statistics, recurrent state carried.
/// - `GradientCheck`: deterministic; dropout inert, batch statistics without
///   running-statistic updates, recurrent state reset to a fixed constant at
///   the start of every sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Train,
    Eval,
    GradientCheck,
}

/// Everything a layer needs to materialize itself at bind time.
pub struct BindContext {
    pub backend: BackendHandle,
    pub optimizer: OptimizerConfig,
    pub rng: SimpleRng,
}

impl BindContext {
    pub fn new(backend: BackendHandle, optimizer: OptimizerConfig, seed: u64) -> Self {
        Self {
            backend,
            optimizer,
            rng: SimpleRng::new(seed),
        }
    }

    /// Native/BLAS default backend, default Adam configuration.
    pub fn with_seed(seed: u64) -> Self {
        Self::new(default_backend(), OptimizerConfig::default(), seed)
    }

    /// Resolves a per-layer optimizer override against the model default.
    pub fn optimizer_kind(&self, requested: Option<OptimizerKind>) -> OptimizerKind {
        requested.unwrap_or(self.optimizer.kind)
    }

    pub fn parameter(&self, name: &'static str, values: Vec<f32>, kind: OptimizerKind) -> Parameter {
        Parameter::new(name, values, self.optimizer.create(kind))
    }
}

/// Pushes a forward cache. Eval mode keeps only the latest entry because no
/// backward pass will consume it.
pub(crate) fn record_step<T>(history: &mut Vec<T>, mode: Mode, step: T) {
    if mode == Mode::Eval {
        history.clear();
    }
    history.push(step);
}

/// Pops the most recent forward cache.
pub(crate) fn pop_step<T>(history: &mut Vec<T>, layer: &str) -> Result<T> {
    history.pop().ok_or_else(|| {
        NetworkError::InvalidState(format!("{}: backward called without a forward pass", layer))
    })
}

pub(crate) fn not_bound(layer: &str) -> NetworkError {
    NetworkError::InvalidState(format!("{} layer used before bind", layer))
}

/// Writes `type_tag` followed by the layer record.
pub fn write_layer(layer: &dyn Layer, writer: &mut ModelWriter<'_>) -> Result<()> {
    writer.write_str(layer.type_tag())?;
    layer.export_state(writer)
}

/// Reads one tagged layer record and rebuilds the bound layer.
pub fn read_layer(reader: &mut ModelReader<'_>, ctx: &mut BindContext) -> Result<Box<dyn Layer>> {
    let tag = reader.read_str()?;
    let layer: Box<dyn Layer> = match tag.as_str() {
        dense::TYPE_TAG => Box::new(DenseLayer::import(reader, ctx)?),
        conv2d::TYPE_TAG => Box::new(Conv2DLayer::import(reader, ctx)?),
        pooling::TYPE_TAG => Box::new(PoolingLayer::import(reader, ctx)?),
        dropout::TYPE_TAG => Box::new(DropoutLayer::import(reader, ctx)?),
        gru::TYPE_TAG => Box::new(GruLayer::import(reader, ctx)?),
        batchnorm::TYPE_TAG => Box::new(BatchNormLayer::import(reader, ctx)?),
        lrn::TYPE_TAG => Box::new(LrnLayer::import(reader, ctx)?),
        l2norm::TYPE_TAG => Box::new(L2NormLayer::import(reader, ctx)?),
        scale::TYPE_TAG => Box::new(ScaleLayer::import(reader, ctx)?),
        interpolation::TYPE_TAG => Box::new(InterpolationLayer::import(reader, ctx)?),
        inception::TYPE_TAG => Box::new(MultiBranchConcat::import(reader, ctx)?),
        residual::TYPE_TAG => Box::new(ResidualLayer::import(reader, ctx)?),
        pyramid::TYPE_TAG => Box::new(PyramidPoolLayer::import(reader, ctx)?),
        other => {
            return Err(NetworkError::Serialization(format!(
                "unknown layer tag '{}'",
                other
            )))
        }
    };
    Ok(layer)
}
