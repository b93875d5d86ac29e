//! Architecture configuration structures
//!
//! This module lets a network be described in a JSON file instead of code:
//! the input shape, the cost function and an ordered list of layers. Layers
//! are built unbound from their hyperparameters; [`build_model`] binds them
//! into a [`Model`]. Composite layers nest their branch definitions.

use crate::config::TrainingConfig;
use crate::cost::Cost;
use crate::error::{NetworkError, Result};
use crate::layers::inception::InceptionFilters;
use crate::layers::{
    BatchNormLayer, Chain, Conv2DLayer, DenseLayer, DropoutLayer, GruLayer, Initializer,
    InterpolationLayer, L2NormLayer, Layer, LrnLayer, MultiBranchConcat, PoolMode, PoolingLayer,
    PyramidPoolLayer, ResidualLayer, ScaleLayer,
};
use crate::model::{Model, ModelBuilder};
use crate::optimizers::OptimizerKind;
use crate::tensor::Shape;
use crate::utils::Activation;
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Configuration for a single layer.
///
/// `layer_type` selects the variant; the other fields are read only by the
/// variants that use them:
///
/// - **dense**: `output_size`, optional `activation`, `initializer`
/// - **convolution** (`conv2d`): `filters`, `kernel_size`, optional `stride`
///   (1), `padding` (0), `dilation` (1), `activation`, `initializer`
/// - **pooling**: `pool_mode`, `kernel_size`, optional `stride` (=
///   `kernel_size`), `padding` (0)
/// - **dropout**: `drop_rate`
/// - **gru**: `hidden_size`, optional `gate_activation` (sigmoid),
///   `state_activation` (tanh), `initializer`
/// - **batch_norm** (`batchnorm`): optional `epsilon`, `momentum`, `activation`
/// - **lrn**: optional `size`, `alpha`, `beta`, `k`
/// - **l2_norm**, **interpolation** (`height`, `width`), **scale** (optional `activation`)
/// - **multi_branch_concat**: `branches`, a list of layer lists
/// - **inception**: `conv1x1`, `reduce3x3`, `conv3x3`, `reduce5x5`, `conv5x5`
/// - **residual**: `bottleneck`, `out_channels`, optional `stride` (1)
/// - **pyramid_pool**: `filters`, optional `bins` (`[1, 2, 3, 6]`)
///
/// Every parameterized layer also accepts `optimizer` to override the
/// model-wide optimizer kind.
///
/// # Examples
///
/// ```json
/// { "layer_type": "convolution", "filters": 8, "kernel_size": 3, "padding": 1, "activation": "relu" }
/// ```
///
/// ```json
/// {
///   "layer_type": "multi_branch_concat",
///   "branches": [
///     [{ "layer_type": "convolution", "filters": 2, "kernel_size": 1 }],
///     [{ "layer_type": "pooling", "pool_mode": "max", "kernel_size": 3, "stride": 1, "padding": 1 }]
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub layer_type: String,

    pub activation: Option<Activation>,
    pub initializer: Option<Initializer>,
    pub optimizer: Option<OptimizerKind>,

    // Dense / GRU
    pub output_size: Option<usize>,
    pub hidden_size: Option<usize>,
    pub gate_activation: Option<Activation>,
    pub state_activation: Option<Activation>,

    // Convolution / pooling
    pub filters: Option<usize>,
    pub kernel_size: Option<usize>,
    pub stride: Option<usize>,
    pub padding: Option<usize>,
    pub dilation: Option<usize>,
    pub pool_mode: Option<PoolMode>,

    pub drop_rate: Option<f32>,

    // Normalization
    pub epsilon: Option<f32>,
    pub momentum: Option<f32>,
    pub size: Option<usize>,
    pub alpha: Option<f32>,
    pub beta: Option<f32>,
    pub k: Option<f32>,

    // Interpolation
    pub height: Option<usize>,
    pub width: Option<usize>,

    // Composites
    pub branches: Option<Vec<Vec<LayerConfig>>>,
    pub conv1x1: Option<usize>,
    pub reduce3x3: Option<usize>,
    pub conv3x3: Option<usize>,
    pub reduce5x5: Option<usize>,
    pub conv5x5: Option<usize>,
    pub bottleneck: Option<usize>,
    pub out_channels: Option<usize>,
    pub bins: Option<Vec<usize>>,
}

fn default_cost() -> Cost {
    Cost::MeanSquaredError
}

/// Configuration for a whole network.
///
/// # Example
///
/// ```json
/// {
///   "input": { "channels": 1, "height": 8, "width": 8 },
///   "cost": "cross_entropy",
///   "layers": [
///     { "layer_type": "convolution", "filters": 4, "kernel_size": 3, "activation": "relu" },
///     { "layer_type": "pooling", "pool_mode": "max", "kernel_size": 2 },
///     { "layer_type": "dense", "output_size": 10, "activation": "softmax" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ArchitectureConfig {
    /// Shape of one input example.
    pub input: Shape,
    #[serde(default = "default_cost")]
    pub cost: Cost,
    pub layers: Vec<LayerConfig>,
}

/// Loads and validates an architecture file.
///
/// # Errors
///
/// `Io`/`Json` when the file cannot be read or parsed, `Config` when a layer
/// is missing a required field or names an unknown type.
///
/// # Examples
///
/// ```no_run
/// use rust_neural_engine::architecture::load_architecture;
///
/// let config = load_architecture("config/architectures/cnn.json").unwrap();
/// assert!(!config.layers.is_empty());
/// ```
pub fn load_architecture<P: AsRef<Path>>(path: P) -> Result<ArchitectureConfig> {
    let contents = fs::read_to_string(path)?;
    let config: ArchitectureConfig = serde_json::from_str(&contents)?;
    validate_architecture(&config)?;
    Ok(config)
}

/// Checks that every layer can be constructed. Shape compatibility is only
/// known once the layers are bound, in [`build_model`].
pub fn validate_architecture(config: &ArchitectureConfig) -> Result<()> {
    config
        .input
        .validate()
        .map_err(|e| NetworkError::Config(format!("input: {}", e)))?;
    if config.layers.is_empty() {
        return Err(NetworkError::Config(
            "architecture must contain at least one layer".to_string(),
        ));
    }
    for (i, layer) in config.layers.iter().enumerate() {
        build_layer(i, layer)?;
    }
    Ok(())
}

fn required<T>(value: Option<T>, index: usize, layer: &str, field: &str) -> Result<T> {
    value.ok_or_else(|| {
        NetworkError::Config(format!("layer {}: {} layer missing {}", index, layer, field))
    })
}

fn with_override<L>(layer: L, kind: Option<OptimizerKind>, set: fn(L, OptimizerKind) -> L) -> L {
    match kind {
        Some(kind) => set(layer, kind),
        None => layer,
    }
}

fn build_chain(index: usize, layers: &[LayerConfig]) -> Result<Chain> {
    let mut chain = Chain::identity();
    for layer in layers {
        chain.push(build_layer(index, layer)?);
    }
    Ok(chain)
}

/// Builds one unbound layer. `index` only labels error messages.
pub fn build_layer(index: usize, config: &LayerConfig) -> Result<Box<dyn Layer>> {
    let activation = config.activation.unwrap_or_default();
    let layer_type = config.layer_type.to_lowercase();

    let layer: Box<dyn Layer> = match layer_type.as_str() {
        "dense" => {
            let output_size = required(config.output_size, index, "dense", "output_size")?;
            let layer = DenseLayer::new(output_size, activation)
                .with_initializer(config.initializer.unwrap_or_default());
            Box::new(with_override(layer, config.optimizer, DenseLayer::with_optimizer))
        }
        "convolution" | "conv2d" => {
            let filters = required(config.filters, index, "convolution", "filters")?;
            let kernel_size = required(config.kernel_size, index, "convolution", "kernel_size")?;
            let layer = Conv2DLayer::new(
                filters,
                kernel_size,
                config.stride.unwrap_or(1),
                config.padding.unwrap_or(0),
                activation,
            )
            .with_dilation(config.dilation.unwrap_or(1))
            .with_initializer(config.initializer.unwrap_or_default());
            Box::new(with_override(layer, config.optimizer, Conv2DLayer::with_optimizer))
        }
        "pooling" => {
            let mode = required(config.pool_mode, index, "pooling", "pool_mode")?;
            let kernel_size = required(config.kernel_size, index, "pooling", "kernel_size")?;
            Box::new(PoolingLayer::new(
                mode,
                kernel_size,
                config.stride.unwrap_or(kernel_size),
                config.padding.unwrap_or(0),
            ))
        }
        "dropout" => {
            let rate = required(config.drop_rate, index, "dropout", "drop_rate")?;
            Box::new(
                DropoutLayer::new(rate)
                    .map_err(|e| NetworkError::Config(format!("layer {}: {}", index, e)))?,
            )
        }
        "gru" => {
            let hidden = required(config.hidden_size, index, "gru", "hidden_size")?;
            let layer = GruLayer::new(hidden)
                .with_activations(
                    config.gate_activation.unwrap_or(Activation::Sigmoid),
                    config.state_activation.unwrap_or(Activation::Tanh),
                )
                .with_initializer(config.initializer.unwrap_or_default());
            Box::new(with_override(layer, config.optimizer, GruLayer::with_optimizer))
        }
        "batch_norm" | "batchnorm" => {
            let mut layer = BatchNormLayer::new().with_activation(activation);
            if config.epsilon.is_some() || config.momentum.is_some() {
                layer = layer
                    .with_hyperparameters(
                        config.epsilon.unwrap_or(1e-5),
                        config.momentum.unwrap_or(0.9),
                    )
                    .map_err(|e| NetworkError::Config(format!("layer {}: {}", index, e)))?;
            }
            Box::new(with_override(layer, config.optimizer, BatchNormLayer::with_optimizer))
        }
        "lrn" => {
            let defaults = LrnLayer::default();
            Box::new(LrnLayer::new(
                config.size.unwrap_or(defaults.size()),
                config.alpha.unwrap_or(defaults.alpha()),
                config.beta.unwrap_or(defaults.beta()),
                config.k.unwrap_or(defaults.k()),
            ))
        }
        "l2_norm" | "l2norm" => Box::new(L2NormLayer::new()),
        "scale" => Box::new(with_override(
            ScaleLayer::new(activation),
            config.optimizer,
            ScaleLayer::with_optimizer,
        )),
        "interpolation" => {
            let height = required(config.height, index, "interpolation", "height")?;
            let width = required(config.width, index, "interpolation", "width")?;
            Box::new(InterpolationLayer::new(height, width))
        }
        "multi_branch_concat" => {
            let branches = required(config.branches.as_ref(), index, "multi_branch_concat", "branches")?;
            let chains = branches
                .iter()
                .map(|branch| build_chain(index, branch))
                .collect::<Result<Vec<_>>>()?;
            Box::new(MultiBranchConcat::new(chains))
        }
        "inception" => {
            let field = |value, name| required(value, index, "inception", name);
            Box::new(MultiBranchConcat::inception(InceptionFilters {
                conv1x1: field(config.conv1x1, "conv1x1")?,
                reduce3x3: field(config.reduce3x3, "reduce3x3")?,
                conv3x3: field(config.conv3x3, "conv3x3")?,
                reduce5x5: field(config.reduce5x5, "reduce5x5")?,
                conv5x5: field(config.conv5x5, "conv5x5")?,
            }))
        }
        "residual" => {
            let bottleneck = required(config.bottleneck, index, "residual", "bottleneck")?;
            let out_channels = required(config.out_channels, index, "residual", "out_channels")?;
            Box::new(ResidualLayer::new(
                bottleneck,
                out_channels,
                config.stride.unwrap_or(1),
            ))
        }
        "pyramid_pool" => {
            let filters = required(config.filters, index, "pyramid_pool", "filters")?;
            Box::new(match &config.bins {
                Some(bins) => PyramidPoolLayer::with_bins(filters, bins.clone()),
                None => PyramidPoolLayer::new(filters),
            })
        }
        _ => {
            return Err(NetworkError::Config(format!(
                "layer {}: invalid layer type '{}'",
                index, config.layer_type
            )));
        }
    };
    Ok(layer)
}

/// Builds the unbound layer list in declaration order.
pub fn build_layers(config: &ArchitectureConfig) -> Result<Vec<Box<dyn Layer>>> {
    config
        .layers
        .iter()
        .enumerate()
        .map(|(i, layer)| build_layer(i, layer))
        .collect()
}

/// Builds and binds a model from an architecture and training settings
/// (optimizer hyperparameters and seed).
///
/// # Examples
///
/// ```no_run
/// use rust_neural_engine::architecture::{build_model, load_architecture};
/// use rust_neural_engine::config::TrainingConfig;
///
/// let arch = load_architecture("config/architectures/cnn.json").unwrap();
/// let model = build_model(&arch, &TrainingConfig::default()).unwrap();
/// println!("{}", model.summary());
/// ```
pub fn build_model(config: &ArchitectureConfig, training: &TrainingConfig) -> Result<Model> {
    let mut builder = ModelBuilder::new(config.input)
        .cost(config.cost)
        .optimizer(training.optimizer)
        .seed(training.seed);
    for layer in build_layers(config)? {
        builder = builder.boxed_layer(layer);
    }
    builder.build()
}
