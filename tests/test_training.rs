// Training loop behaviour: convergence, batching, checkpoints, progress
// reporting and backward-through-time.

use rust_neural_engine::config::TrainingConfig;
use rust_neural_engine::model::Example;
use rust_neural_engine::progress::{LossFileSink, NullSink};
use rust_neural_engine::utils::Activation;
use rust_neural_engine::{
    Conv2DLayer, Cost, DenseLayer, GruLayer, Mode, Model, ModelBuilder, NetworkError,
    OptimizerConfig, OptimizerKind, PoolMode, PoolingLayer, Shape,
};
use std::fs;
use tempfile::tempdir;

fn xor_dataset() -> Vec<Example> {
    vec![
        (vec![0.0, 0.0], vec![1.0, 0.0]),
        (vec![0.0, 1.0], vec![0.0, 1.0]),
        (vec![1.0, 0.0], vec![0.0, 1.0]),
        (vec![1.0, 1.0], vec![1.0, 0.0]),
    ]
}

fn xor_model(seed: u64) -> Model {
    ModelBuilder::new(Shape::flat(2))
        .layer(DenseLayer::new(8, Activation::Tanh))
        .layer(DenseLayer::new(2, Activation::Softmax))
        .cost(Cost::CrossEntropy)
        .optimizer(OptimizerConfig::new(OptimizerKind::Adam, 0.05))
        .seed(seed)
        .build()
        .unwrap()
}

// ============================================================================
// Convergence
// ============================================================================

#[test]
fn test_xor_converges() {
    let mut model = xor_model(3);
    let config = TrainingConfig {
        batch_size: 4,
        epochs: 300,
        ..TrainingConfig::default()
    };
    let mut history: Vec<(usize, f32)> = Vec::new();
    let final_cost = model.train(&xor_dataset(), &config, &mut history).unwrap();
    assert!(final_cost < 0.1, "final cost {}", final_cost);
    assert_eq!(history.len(), 300);

    model.set_mode(Mode::Eval);
    for (input, target) in xor_dataset() {
        let output = model.forward(&input, 1).unwrap();
        let predicted = if output[0] > output[1] { 0 } else { 1 };
        let expected = if target[0] > target[1] { 0 } else { 1 };
        assert_eq!(predicted, expected, "input {:?} gave {:?}", input, output);
    }
}

#[test]
fn test_sparse_targets_converge() {
    let mut model = ModelBuilder::new(Shape::flat(2))
        .layer(DenseLayer::new(8, Activation::Tanh))
        .layer(DenseLayer::new(2, Activation::Softmax))
        .cost(Cost::SparseCrossEntropy)
        .optimizer(OptimizerConfig::new(OptimizerKind::AmsGrad, 0.05))
        .seed(7)
        .build()
        .unwrap();
    let dataset: Vec<Example> = xor_dataset()
        .into_iter()
        .map(|(x, t)| (x, vec![if t[0] > t[1] { 0.0 } else { 1.0 }]))
        .collect();
    let config = TrainingConfig {
        batch_size: 2,
        epochs: 300,
        ..TrainingConfig::default()
    };
    let final_cost = model.train(&dataset, &config, &mut NullSink).unwrap();
    assert!(final_cost < 0.2, "final cost {}", final_cost);
}

#[test]
fn test_small_cnn_reduces_cost() {
    let mut model = ModelBuilder::new(Shape::new(1, 4, 4))
        .layer(Conv2DLayer::new(2, 3, 1, 1, Activation::Relu))
        .layer(PoolingLayer::new(PoolMode::Max, 2, 2, 0))
        .layer(DenseLayer::new(2, Activation::Softmax))
        .cost(Cost::CrossEntropy)
        .optimizer(OptimizerConfig::new(OptimizerKind::Adam, 0.02))
        .seed(5)
        .build()
        .unwrap();
    // Bright top half versus bright bottom half.
    let top: Vec<f32> = (0..16).map(|i| if i < 8 { 1.0 } else { 0.0 }).collect();
    let bottom: Vec<f32> = (0..16).map(|i| if i < 8 { 0.0 } else { 1.0 }).collect();
    let dataset = vec![(top, vec![1.0, 0.0]), (bottom, vec![0.0, 1.0])];
    let mut history: Vec<(usize, f32)> = Vec::new();
    let config = TrainingConfig {
        batch_size: 2,
        epochs: 100,
        ..TrainingConfig::default()
    };
    model.train(&dataset, &config, &mut history).unwrap();
    let first = history[0].1;
    let last = history[history.len() - 1].1;
    assert!(last < first * 0.5, "cost went from {} to {}", first, last);
}

// ============================================================================
// Batching and reporting
// ============================================================================

#[test]
fn test_partial_final_batch_and_step_numbering() {
    let mut model = xor_model(1);
    let dataset: Vec<Example> = xor_dataset().into_iter().cycle().take(5).collect();
    let config = TrainingConfig {
        batch_size: 2,
        epochs: 2,
        ..TrainingConfig::default()
    };
    let mut history: Vec<(usize, f32)> = Vec::new();
    model.train(&dataset, &config, &mut history).unwrap();
    // ceil(5 / 2) = 3 batches per epoch
    let steps: Vec<usize> = history.iter().map(|&(s, _)| s).collect();
    assert_eq!(steps, vec![1, 2, 3, 4, 5, 6]);
    assert!(history.iter().all(|&(_, c)| c.is_finite() && c >= 0.0));
}

#[test]
fn test_loss_file_receives_every_step() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("loss.txt");
    let mut model = xor_model(2);
    let config = TrainingConfig {
        batch_size: 1,
        epochs: 2,
        ..TrainingConfig::default()
    };
    {
        let mut sink = LossFileSink::create(&path).unwrap();
        model.train(&xor_dataset(), &config, &mut sink).unwrap();
    }
    let contents = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 8);
    assert!(lines[0].starts_with("1,"));
    assert!(lines[7].starts_with("8,"));
}

#[test]
fn test_checkpoint_written_and_loadable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("checkpoint.bin");
    let mut model = xor_model(4);
    let config = TrainingConfig {
        batch_size: 2,
        epochs: 1,
        checkpoint_interval: Some(2),
        checkpoint_name: Some(path.to_string_lossy().into_owned()),
        ..TrainingConfig::default()
    };
    model.train(&xor_dataset(), &config, &mut NullSink).unwrap();
    let loaded = Model::load(&path, model.optimizer_config()).unwrap();
    for (a, b) in model.parameters().iter().zip(loaded.parameters()) {
        assert_eq!(a.values(), b.values());
    }
}

#[test]
fn test_failed_checkpoint_does_not_stop_training() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing-dir").join("checkpoint.bin");
    let mut model = xor_model(4);
    let config = TrainingConfig {
        batch_size: 1,
        epochs: 1,
        checkpoint_interval: Some(1),
        checkpoint_name: Some(path.to_string_lossy().into_owned()),
        ..TrainingConfig::default()
    };
    assert!(model.train(&xor_dataset(), &config, &mut NullSink).is_ok());
    assert!(!path.exists());
}

#[test]
fn test_train_restores_previous_mode() {
    let mut model = xor_model(6);
    model.set_mode(Mode::Eval);
    let config = TrainingConfig {
        batch_size: 4,
        epochs: 1,
        ..TrainingConfig::default()
    };
    model.train(&xor_dataset(), &config, &mut NullSink).unwrap();
    assert_eq!(model.mode(), Mode::Eval);
}

#[test]
fn test_dataset_with_wrong_target_length() {
    let mut model = xor_model(1);
    let dataset = vec![(vec![0.0, 1.0], vec![1.0])];
    let result = model.train(&dataset, &TrainingConfig::default(), &mut NullSink);
    assert!(matches!(result, Err(NetworkError::DimensionMismatch { .. })));
}

#[test]
fn test_empty_dataset_rejected() {
    let mut model = xor_model(1);
    let result = model.train(&[], &TrainingConfig::default(), &mut NullSink);
    assert!(matches!(result, Err(NetworkError::Config(_))));
}

// ============================================================================
// Backward-through-time
// ============================================================================

#[test]
fn test_sequence_training_reduces_cost() {
    let mut model = ModelBuilder::new(Shape::flat(1))
        .layer(GruLayer::new(6))
        .layer(DenseLayer::new(1, Activation::Identity))
        .optimizer(OptimizerConfig::new(OptimizerKind::Adam, 0.02))
        .seed(9)
        .build()
        .unwrap();
    // Echo the previous input.
    let inputs: Vec<Vec<f32>> = [0.5, -0.5, 0.25, 0.75, -0.25]
        .iter()
        .map(|&v| vec![v])
        .collect();
    let mut targets = vec![vec![0.0]];
    targets.extend(inputs[..inputs.len() - 1].iter().cloned());

    let first = model.train_sequence(&inputs, &targets, 1).unwrap();
    let mut last = first;
    for _ in 0..150 {
        last = model.train_sequence(&inputs, &targets, 1).unwrap();
    }
    assert!(last < first * 0.5, "cost went from {} to {}", first, last);
}

#[test]
fn test_sequence_length_mismatch() {
    let mut model = ModelBuilder::new(Shape::flat(1))
        .layer(GruLayer::new(2))
        .build()
        .unwrap();
    let result = model.train_sequence(&[vec![0.0], vec![1.0]], &[vec![0.0, 0.0]], 1);
    assert!(result.is_err());
}
