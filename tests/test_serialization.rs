// Save/load round trips through the binary model format.

use rust_neural_engine::layers::inception::InceptionFilters;
use rust_neural_engine::backend::default_backend;
use rust_neural_engine::serialization::ModelWriter;
use rust_neural_engine::utils::{Activation, SimpleRng};
use rust_neural_engine::{
    BatchNormLayer, Conv2DLayer, Cost, DenseLayer, DropoutLayer, GruLayer, InterpolationLayer,
    L2NormLayer, LrnLayer, Mode, Model, ModelBuilder, MultiBranchConcat, NetworkError,
    OptimizerConfig, OptimizerKind, PoolMode, PoolingLayer, PyramidPoolLayer, ResidualLayer,
    ScaleLayer, Shape,
};
use std::io::Cursor;
use tempfile::tempdir;

fn random_values(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = SimpleRng::new(seed);
    (0..len).map(|_| rng.gen_range_f32(-1.0, 1.0)).collect()
}

fn round_trip(model: &Model) -> Model {
    let mut bytes = Vec::new();
    model.export(&mut bytes).unwrap();
    Model::import(
        &mut Cursor::new(bytes),
        model.optimizer_config(),
        default_backend(),
    )
    .unwrap()
}

fn assert_same_eval_output(a: &mut Model, b: &mut Model, batch_size: usize) {
    a.set_mode(Mode::Eval);
    b.set_mode(Mode::Eval);
    let input = random_values(batch_size * a.input_shape().size(), 5);
    let ya = a.forward(&input, batch_size).unwrap();
    let yb = b.forward(&input, batch_size).unwrap();
    assert_eq!(ya, yb);
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_dense_model_save_load() {
    let mut model = ModelBuilder::new(Shape::flat(4))
        .layer(DenseLayer::new(5, Activation::Relu))
        .layer(DropoutLayer::new(0.25).unwrap())
        .layer(DenseLayer::new(3, Activation::Softmax))
        .cost(Cost::CrossEntropy)
        .seed(8)
        .build()
        .unwrap();
    // Train a little so the optimizer state is non-trivial.
    for _ in 0..3 {
        model
            .train_batch(&random_values(8, 1), &[1.0, 0.0, 0.0, 0.0, 0.0, 1.0], 2)
            .unwrap();
    }

    let dir = tempdir().unwrap();
    let path = dir.path().join("model.bin");
    model.save(&path).unwrap();
    let mut loaded = Model::load(&path, model.optimizer_config()).unwrap();

    assert_eq!(loaded.cost_function(), Cost::CrossEntropy);
    assert_eq!(loaded.input_shape(), model.input_shape());
    assert_eq!(loaded.output_shape(), model.output_shape());
    assert_eq!(loaded.parameter_count(), model.parameter_count());
    for (a, b) in model.parameters().iter().zip(loaded.parameters()) {
        assert_eq!(a.name(), b.name());
        assert_eq!(a.values(), b.values());
    }
    assert_same_eval_output(&mut model, &mut loaded, 2);
}

#[test]
fn test_training_continues_identically_after_reload() {
    let config = OptimizerConfig::new(OptimizerKind::Adam, 0.01);
    let mut model = ModelBuilder::new(Shape::flat(3))
        .layer(DenseLayer::new(4, Activation::Tanh))
        .layer(DenseLayer::new(2, Activation::Identity).with_optimizer(OptimizerKind::AmsGrad))
        .optimizer(config)
        .seed(4)
        .build()
        .unwrap();
    let input = random_values(6, 2);
    let target = random_values(4, 3);
    model.train_batch(&input, &target, 2).unwrap();

    let mut loaded = round_trip(&model);
    let a = model.train_batch(&input, &target, 2).unwrap();
    let b = loaded.train_batch(&input, &target, 2).unwrap();
    assert_eq!(a, b);
    for (pa, pb) in model.parameters().iter().zip(loaded.parameters()) {
        assert_eq!(pa.values(), pb.values());
        assert_eq!(pa.optimizer().kind(), pb.optimizer().kind());
    }
}

#[test]
fn test_convolutional_stack_round_trip() {
    let mut model = ModelBuilder::new(Shape::new(2, 8, 8))
        .layer(Conv2DLayer::new(4, 3, 1, 1, Activation::Relu).with_dilation(1))
        .layer(BatchNormLayer::new().with_activation(Activation::Relu))
        .layer(LrnLayer::default())
        .layer(PoolingLayer::new(PoolMode::Max, 3, 2, 1))
        .layer(ScaleLayer::new(Activation::Identity))
        .layer(InterpolationLayer::new(6, 6))
        .layer(L2NormLayer::new())
        .layer(DenseLayer::new(3, Activation::Sigmoid))
        .seed(12)
        .build()
        .unwrap();
    model
        .train_batch(&random_values(2 * 128, 9), &random_values(6, 10), 2)
        .unwrap();
    let mut loaded = round_trip(&model);
    assert_eq!(loaded.summary(), model.summary());
    assert_same_eval_output(&mut model, &mut loaded, 2);
}

#[test]
fn test_composite_round_trip() {
    let mut model = ModelBuilder::new(Shape::new(3, 6, 6))
        .layer(MultiBranchConcat::inception(InceptionFilters {
            conv1x1: 2,
            reduce3x3: 1,
            conv3x3: 2,
            reduce5x5: 1,
            conv5x5: 1,
        }))
        .layer(ResidualLayer::new(2, 4, 2))
        .layer(PyramidPoolLayer::with_bins(1, vec![1, 3]))
        .layer(DenseLayer::new(2, Activation::Identity))
        .seed(30)
        .build()
        .unwrap();
    model
        .train_batch(&random_values(2 * 108, 11), &random_values(4, 12), 2)
        .unwrap();
    let mut loaded = round_trip(&model);
    assert_eq!(loaded.parameter_count(), model.parameter_count());
    assert_same_eval_output(&mut model, &mut loaded, 2);
}

#[test]
fn test_gru_round_trip() {
    let mut model = ModelBuilder::new(Shape::flat(3))
        .layer(GruLayer::new(4))
        .layer(DenseLayer::new(2, Activation::Identity))
        .seed(2)
        .build()
        .unwrap();
    let mut loaded = round_trip(&model);
    assert_same_eval_output(&mut model, &mut loaded, 1);
}

// ============================================================================
// Malformed input
// ============================================================================

#[test]
fn test_truncated_file_is_rejected() {
    let model = ModelBuilder::new(Shape::flat(3))
        .layer(DenseLayer::new(2, Activation::Identity))
        .build()
        .unwrap();
    let mut bytes = Vec::new();
    model.export(&mut bytes).unwrap();
    bytes.truncate(bytes.len() - 7);
    let result = Model::import(
        &mut Cursor::new(bytes),
        OptimizerConfig::default(),
        default_backend(),
    );
    assert!(matches!(result, Err(NetworkError::Serialization(_))));
}

#[test]
fn test_unknown_layer_tag_is_rejected() {
    let mut bytes = vec![0, 0, 0, 1];
    bytes.extend_from_slice(&[0, 9]);
    bytes.extend_from_slice(b"attention");
    let result = Model::import(
        &mut Cursor::new(bytes),
        OptimizerConfig::default(),
        default_backend(),
    );
    match result {
        Err(NetworkError::Serialization(msg)) => assert!(msg.contains("attention")),
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("import should fail"),
    }
}

fn expect_serialization_error(bytes: Vec<u8>, needle: &str) {
    let result = Model::import(
        &mut Cursor::new(bytes),
        OptimizerConfig::default(),
        default_backend(),
    );
    match result {
        Err(NetworkError::Serialization(msg)) => {
            assert!(msg.contains(needle), "message '{}' lacks '{}'", msg, needle)
        }
        Err(other) => panic!("unexpected error {}", other),
        Ok(_) => panic!("import should fail"),
    }
}

fn dense_header(writer: &mut ModelWriter<'_>, input: [i32; 3], output_size: i32) {
    writer.write_i32(1).unwrap();
    writer.write_str("dense").unwrap();
    for dim in input {
        writer.write_i32(dim).unwrap();
    }
    for dim in [output_size, 1, 1] {
        writer.write_i32(dim).unwrap();
    }
    writer.write_i32(output_size).unwrap();
    writer.write_str("xavier").unwrap();
    writer.write_str("identity").unwrap();
    writer.write_str("adam").unwrap();
}

#[test]
fn test_oversized_shape_is_rejected() {
    // Element count overflows usize on 32-bit and the i32 cap everywhere
    let mut bytes = Vec::new();
    dense_header(&mut ModelWriter::new(&mut bytes), [i32::MAX; 3], 2);
    expect_serialization_error(bytes, "exceeds");

    // A valid input shape whose weight matrix is too large to allocate
    let mut bytes = Vec::new();
    dense_header(&mut ModelWriter::new(&mut bytes), [i32::MAX, 1, 1], 2);
    expect_serialization_error(bytes, "exceeds");
}

#[test]
fn test_huge_layer_count_hits_end_of_file() {
    let mut bytes = Vec::new();
    ModelWriter::new(&mut bytes).write_i32(i32::MAX).unwrap();
    let result = Model::import(
        &mut Cursor::new(bytes),
        OptimizerConfig::default(),
        default_backend(),
    );
    assert!(matches!(result, Err(NetworkError::Serialization(_))));
}

#[test]
fn test_moment_length_mismatch_is_rejected() {
    // 2 -> 1 dense layer whose weight moments hold a single entry
    let mut bytes = Vec::new();
    {
        let mut writer = ModelWriter::new(&mut bytes);
        dense_header(&mut writer, [2, 1, 1], 1);
        writer.write_i32(1).unwrap();
        writer.write_vec(&[0.1]).unwrap();
        writer.write_vec(&[0.01]).unwrap();
        writer.write_values(&[0.5, -0.5]).unwrap();
        writer.write_i32(0).unwrap();
        writer.write_vec(&[]).unwrap();
        writer.write_vec(&[]).unwrap();
        writer.write_values(&[0.0]).unwrap();
        writer.write_str(Cost::MeanSquaredError.tag()).unwrap();
    }
    expect_serialization_error(bytes, "1 moments for 2 values");
}

#[test]
fn test_missing_file_is_serialization_error() {
    let dir = tempdir().unwrap();
    let result = Model::load(dir.path().join("absent.bin"), OptimizerConfig::default());
    assert!(matches!(result, Err(NetworkError::Serialization(_))));
}
