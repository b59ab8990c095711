mod common;

use candle_core::Device;
use common::{test_model, COLBERT_DIM, HIDDEN};
use embedder::{HeadSelection, Invokable};
use onnx_export::{DenseWrapper, DummyInput};

#[test]
fn wrapper_returns_exactly_one_normalized_tensor() {
    let device = Device::Cpu;
    let mut model = test_model(&device);
    let wrapper = DenseWrapper::new(&mut model);

    let dummy = DummyInput::generate(2, 12, 64, &device).expect("Failed to generate dummy");
    let dense = wrapper
        .invoke(&dummy.input_ids, &dummy.attention_mask)
        .expect("Forward pass failed");

    assert_eq!(dense.dims(), &[2, HIDDEN]);
    for row in 0..2 {
        let vector: Vec<f32> = dense.get(row).unwrap().to_vec1().unwrap();
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!(
            (norm - 1.0).abs() < 0.01,
            "dense vector should be normalized (L2 norm ≈ 1.0), got {norm:.4}"
        );
    }
}

#[test]
fn wrapper_forces_evaluation_mode() {
    let device = Device::Cpu;
    let mut model = test_model(&device);
    model.set_train(true);

    {
        let _wrapper = DenseWrapper::new(&mut model);
    }
    assert!(!model.is_training());
}

#[test]
fn dense_only_selection_skips_aux_heads() {
    let device = Device::Cpu;
    let model = test_model(&device);
    let dummy = DummyInput::generate(1, 8, 64, &device).expect("Failed to generate dummy");

    let narrowed = model
        .forward_with(
            &dummy.input_ids,
            &dummy.attention_mask,
            HeadSelection::dense_only(),
        )
        .expect("Forward pass failed");
    assert!(narrowed.dense.is_some());
    assert!(narrowed.sparse.is_none());
    assert!(narrowed.colbert.is_none());

    let full = model
        .invoke(&dummy.input_ids, &dummy.attention_mask)
        .expect("Forward pass failed");
    assert_eq!(full.dense.unwrap().dims(), &[1, HIDDEN]);
    assert_eq!(full.sparse.unwrap().dims(), &[1, 8]);
    assert_eq!(full.colbert.unwrap().dims(), &[1, 8, COLBERT_DIM]);
}
