// Architecture files: parsing, layer construction and model binding.

use rust_neural_engine::architecture::{
    build_layers, build_model, load_architecture, validate_architecture, ArchitectureConfig,
};
use rust_neural_engine::config::TrainingConfig;
use rust_neural_engine::{Cost, Mode, NetworkError, OptimizerKind, Shape};

// ============================================================================
// Bundled architectures
// ============================================================================

#[test]
fn test_cnn_architecture() {
    let arch = load_architecture("config/architectures/cnn.json").unwrap();
    assert_eq!(arch.input, Shape::new(1, 28, 28));
    assert_eq!(arch.cost, Cost::CrossEntropy);
    let tags: Vec<&str> = build_layers(&arch)
        .unwrap()
        .iter()
        .map(|l| l.type_tag())
        .collect();
    assert_eq!(
        tags,
        vec!["convolution", "batch_norm", "pooling", "convolution", "pooling", "dropout", "dense"]
    );

    let model = build_model(&arch, &TrainingConfig::default()).unwrap();
    assert_eq!(model.output_shape(), Shape::flat(10));
    // conv 1->8 (3x3), bn 8, conv 8->16 (3x3), dense 16*7*7 -> 10
    let expected = (8 * 9 + 8) + 16 + (16 * 8 * 9 + 16) + (16 * 7 * 7 * 10 + 10);
    assert_eq!(model.parameter_count(), expected);
}

#[test]
fn test_composite_architecture() {
    let arch = load_architecture("config/architectures/inception.json").unwrap();
    let mut model = build_model(&arch, &TrainingConfig::default()).unwrap();
    assert_eq!(model.cost_function(), Cost::SparseCrossEntropy);
    assert_eq!(model.output_shape(), Shape::flat(5));
    let dense = model.layers().last().unwrap();
    assert_eq!(dense.parameters()[0].optimizer().kind(), OptimizerKind::AmsGrad);

    model.set_mode(Mode::Eval);
    let input = vec![0.1f32; model.input_shape().size()];
    let output = model.forward(&input, 1).unwrap();
    assert!((output.iter().sum::<f32>() - 1.0).abs() < 1e-5);
}

#[test]
fn test_recurrent_architecture() {
    let arch = load_architecture("config/architectures/gru.json").unwrap();
    let model = build_model(&arch, &TrainingConfig::default()).unwrap();
    assert_eq!(model.layers().len(), 3);
    assert_eq!(model.output_shape(), Shape::flat(8));
}

#[test]
fn test_seed_controls_initialization() {
    let arch = load_architecture("config/architectures/gru.json").unwrap();
    let seeded = |seed| TrainingConfig {
        seed,
        ..TrainingConfig::default()
    };
    let a = build_model(&arch, &seeded(1)).unwrap();
    let b = build_model(&arch, &seeded(1)).unwrap();
    let c = build_model(&arch, &seeded(2)).unwrap();
    assert_eq!(a.parameters()[0].values(), b.parameters()[0].values());
    assert_ne!(a.parameters()[0].values(), c.parameters()[0].values());
}

// ============================================================================
// Invalid definitions
// ============================================================================

fn parse(json: &str) -> ArchitectureConfig {
    serde_json::from_str(json).unwrap()
}

#[test]
fn test_missing_required_field() {
    let arch = parse(
        r#"{"input": {"channels": 1, "height": 4, "width": 4},
            "layers": [{"layer_type": "pooling", "kernel_size": 2}]}"#,
    );
    match validate_architecture(&arch) {
        Err(NetworkError::Config(msg)) => assert!(msg.contains("pool_mode")),
        other => panic!("unexpected result {:?}", other.err()),
    }
}

#[test]
fn test_missing_nested_field() {
    let arch = parse(
        r#"{"input": {"channels": 1, "height": 4, "width": 4},
            "layers": [{"layer_type": "multi_branch_concat",
                        "branches": [[{"layer_type": "convolution", "filters": 2}]]}]}"#,
    );
    assert!(matches!(validate_architecture(&arch), Err(NetworkError::Config(_))));
}

#[test]
fn test_zero_input_dimension() {
    let arch = parse(
        r#"{"input": {"channels": 0, "height": 4, "width": 4},
            "layers": [{"layer_type": "l2_norm"}]}"#,
    );
    assert!(matches!(validate_architecture(&arch), Err(NetworkError::Config(_))));
}

#[test]
fn test_softmax_with_mse_rejected_at_build() {
    let arch = parse(
        r#"{"input": {"channels": 3, "height": 1, "width": 1},
            "cost": "mean_squared_error",
            "layers": [{"layer_type": "dense", "output_size": 2, "activation": "softmax"}]}"#,
    );
    assert!(matches!(
        build_model(&arch, &TrainingConfig::default()),
        Err(NetworkError::UnsupportedCombination(_))
    ));
}

#[test]
fn test_unknown_cost_fails_to_parse() {
    let result: Result<ArchitectureConfig, _> = serde_json::from_str(
        r#"{"input": {"channels": 1, "height": 1, "width": 1}, "cost": "hinge", "layers": []}"#,
    );
    assert!(result.is_err());
}
