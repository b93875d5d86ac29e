// Behavioural properties of the engine: determinism, layout helpers,
// activation and cost values, and pooling switch routing.

use approx::assert_relative_eq;
use rust_neural_engine::layers::BindContext;
use rust_neural_engine::tensor::{pad, unpad};
use rust_neural_engine::utils::{softmax_rows, Activation};
use rust_neural_engine::{
    BatchNormLayer, Conv2DLayer, Cost, DenseLayer, DropoutLayer, GruLayer, Layer, Mode,
    ModelBuilder, NetworkError, PoolMode, PoolingLayer, Shape,
};

// ============================================================================
// Determinism
// ============================================================================

#[test]
fn test_eval_forward_is_deterministic() {
    let mut model = ModelBuilder::new(Shape::new(1, 6, 6))
        .layer(Conv2DLayer::new(3, 3, 1, 1, Activation::Relu))
        .layer(BatchNormLayer::new())
        .layer(PoolingLayer::new(PoolMode::Max, 2, 2, 0))
        .layer(DropoutLayer::new(0.5).unwrap())
        .layer(DenseLayer::new(4, Activation::Softmax))
        .cost(Cost::CrossEntropy)
        .seed(21)
        .build()
        .unwrap();
    model.set_mode(Mode::Eval);
    let input: Vec<f32> = (0..72).map(|i| ((i * 37) % 17) as f32 / 17.0).collect();
    let first = model.forward(&input, 2).unwrap();
    for _ in 0..3 {
        assert_eq!(model.forward(&input, 2).unwrap(), first);
    }
}

#[test]
fn test_same_seed_builds_same_model() {
    let build = || {
        ModelBuilder::new(Shape::flat(3))
            .layer(DenseLayer::new(4, Activation::Tanh))
            .layer(GruLayer::new(2))
            .seed(99)
            .build()
            .unwrap()
    };
    let (a, b) = (build(), build());
    for (pa, pb) in a.parameters().iter().zip(b.parameters()) {
        assert_eq!(pa.values(), pb.values());
    }
}

// ============================================================================
// Padding
// ============================================================================

#[test]
fn test_unpad_inverts_pad() {
    let shape = Shape::new(2, 3, 4);
    let input: Vec<f32> = (0..2 * shape.size()).map(|v| v as f32 - 10.0).collect();
    for (ph, pw) in [(0, 0), (1, 1), (2, 1), (0, 3)] {
        let padded = pad(&input, 2, shape, ph, pw, 0.0);
        assert_eq!(padded.len(), 2 * 2 * (3 + 2 * ph) * (4 + 2 * pw));
        assert_eq!(unpad(&padded, 2, shape, ph, pw), input);
    }
}

// ============================================================================
// Softmax
// ============================================================================

#[test]
fn test_softmax_sums_to_one_and_is_shift_invariant() {
    let logits = [0.5f32, -1.25, 3.0, 0.0, 2.0, 2.0];
    let mut a = logits.to_vec();
    softmax_rows(&mut a, 2, 3);
    let mut b: Vec<f32> = logits.iter().map(|v| v + 42.0).collect();
    softmax_rows(&mut b, 2, 3);
    for row in a.chunks(3) {
        assert_relative_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    }
    for (x, y) in a.iter().zip(&b) {
        assert_relative_eq!(x, y, epsilon = 1e-6);
    }
}

#[test]
fn test_softmax_extreme_negative_logits() {
    let mut values = vec![-1000.0f32, -2000.0, -3000.0];
    Activation::Softmax.apply(&mut values, 1);
    assert_relative_eq!(values[0], 1.0, epsilon = 1e-6);
    assert_relative_eq!(values[1], 0.0, epsilon = 1e-6);
    assert_relative_eq!(values[2], 0.0, epsilon = 1e-6);
}

// ============================================================================
// Cost values
// ============================================================================

#[test]
fn test_sparse_cross_entropy_value() {
    let cost = Cost::SparseCrossEntropy
        .cost(&[0.2, 0.6, 0.1, 0.0, 0.1], &[2.0], 1)
        .unwrap();
    assert_relative_eq!(cost, 2.302585, epsilon = 1e-5);
}

#[test]
fn test_mean_squared_error_value() {
    let cost = Cost::MeanSquaredError
        .cost(&[0.3, 0.2, 0.6, 0.4, 0.7], &[0.2, 0.1, 0.6, 0.3, 0.3], 1)
        .unwrap();
    assert_relative_eq!(cost, 0.095, epsilon = 1e-5);
}

#[test]
fn test_cross_entropy_of_zero_output_is_finite() {
    let cost = Cost::CrossEntropy.cost(&[0.0, 1.0], &[1.0, 0.0], 1).unwrap();
    assert!(cost.is_finite());
}

// ============================================================================
// Max pooling switches
// ============================================================================

#[test]
fn test_max_pool_forward_and_backward() {
    let mut layer = PoolingLayer::new(PoolMode::Max, 2, 2, 0);
    let out_shape = layer
        .bind(Shape::new(1, 4, 4), &mut BindContext::with_seed(0))
        .unwrap();
    assert_eq!(out_shape, Shape::new(1, 2, 2));

    let input = [
        1.0, 1.0, 2.0, 4.0, 5.0, 6.0, 7.0, 8.0, 3.0, 2.0, 1.0, 0.0, 1.0, 2.0, 3.0, 4.0,
    ];
    let output = layer.forward(&input, 1).unwrap();
    assert_eq!(output, vec![6.0, 8.0, 3.0, 4.0]);

    let delta = layer.backward(&[1.0, 2.0, 3.0, 4.0], true).unwrap().unwrap();
    assert_eq!(
        delta,
        vec![0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 2.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 4.0]
    );
}

// ============================================================================
// Error taxonomy
// ============================================================================

#[test]
fn test_incompatible_shapes_fail_at_build() {
    let result = ModelBuilder::new(Shape::new(1, 3, 3))
        .layer(PoolingLayer::new(PoolMode::Max, 2, 2, 0))
        .layer(Conv2DLayer::new(1, 3, 1, 0, Activation::Identity))
        .build();
    assert!(matches!(result, Err(NetworkError::InvalidShape(_))));
}

#[test]
fn test_backward_without_forward_is_invalid_state() {
    let mut model = ModelBuilder::new(Shape::flat(2))
        .layer(DenseLayer::new(1, Activation::Identity))
        .build()
        .unwrap();
    assert!(matches!(
        model.backward(&[0.0]),
        Err(NetworkError::InvalidState(_))
    ));
}

#[test]
fn test_zero_batch_size_rejected() {
    let mut model = ModelBuilder::new(Shape::flat(2))
        .layer(DenseLayer::new(1, Activation::Identity))
        .build()
        .unwrap();
    assert!(matches!(
        model.train_batch(&[], &[], 0),
        Err(NetworkError::InvalidBatchSize(0))
    ));
}
