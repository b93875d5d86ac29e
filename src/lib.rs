//! Rust Neural Engine
//!
//! A layer-wise neural network training engine. Every layer derives its own
//! backward pass by hand; there is no autodiff graph. Models are assembled
//! from heterogeneous layers, bound to an input shape once, then trained
//! with mini-batch gradient descent or backward-through-time.
//!
//! # Modules
//!
//! - `layers`: Layer trait, primitive layers and composite blocks
//! - `model`: Model builder, training loop, gradient check, save/load
//! - `optimizers`: Optimizer trait and implementations (Adam, AMSGrad, SGD)
//! - `cost`: Cost functions and their derivatives
//! - `backend`: Matrix-multiply kernels (native rayon or BLAS)
//! - `tensor`: Shape and flat-buffer layout helpers
//! - `serialization`: Binary model record primitives
//! - `progress`: Training progress sinks
//! - `utils`: Seeded RNG and activation functions
//! - `config`: Training configuration
//! - `architecture`: JSON architecture files and model building

pub mod architecture;
pub mod backend;
pub mod config;
pub mod cost;
pub mod error;
pub mod layers;
pub mod model;
pub mod optimizers;
pub mod progress;
pub mod serialization;
pub mod tensor;
pub mod utils;

pub use cost::Cost;
pub use error::{NetworkError, Result};
pub use layers::{
    BatchNormLayer, Chain, Conv2DLayer, DenseLayer, DropoutLayer, GruLayer, InterpolationLayer,
    L2NormLayer, Layer, LrnLayer, Mode, MultiBranchConcat, PoolMode, PoolingLayer,
    PyramidPoolLayer, ResidualLayer, ScaleLayer,
};
pub use model::{GradientCheckReport, Model, ModelBuilder};
pub use optimizers::{OptimizerConfig, OptimizerKind};
pub use tensor::Shape;
