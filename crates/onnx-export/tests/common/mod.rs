#![allow(dead_code)]

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use embedder::M3Model;
use onnx_export::{ATTENTION_MASK, DummyInput, INPUT_IDS};

pub const HIDDEN: usize = 32;
pub const LAYERS: usize = 2;
pub const INTERMEDIATE: usize = 64;
pub const VOCAB: usize = 64;
pub const MAX_POSITIONS: usize = 32;
pub const COLBERT_DIM: usize = 16;

/// A scaled-down BERT config; same layout as a real checkpoint's config.json.
pub const CONFIG_JSON: &str = r#"{
    "architectures": ["BertModel"],
    "model_type": "bert",
    "vocab_size": 64,
    "hidden_size": 32,
    "num_hidden_layers": 2,
    "num_attention_heads": 2,
    "intermediate_size": 64,
    "hidden_act": "gelu",
    "hidden_dropout_prob": 0.1,
    "attention_probs_dropout_prob": 0.1,
    "max_position_embeddings": 32,
    "type_vocab_size": 2,
    "initializer_range": 0.02,
    "layer_norm_eps": 1e-12,
    "pad_token_id": 0,
    "position_embedding_type": "absolute",
    "classifier_dropout": null
}"#;

fn randn(tensors: &mut HashMap<String, Tensor>, name: &str, shape: &[usize], device: &Device) {
    let tensor =
        Tensor::randn(0f32, 0.2f32, shape.to_vec(), device).expect("Failed to create tensor");
    tensors.insert(name.to_string(), tensor);
}

fn layer_norm_params(tensors: &mut HashMap<String, Tensor>, prefix: &str, device: &Device) {
    tensors.insert(
        format!("{prefix}.weight"),
        Tensor::ones(HIDDEN, DType::F32, device).unwrap(),
    );
    tensors.insert(
        format!("{prefix}.bias"),
        Tensor::zeros(HIDDEN, DType::F32, device).unwrap(),
    );
}

/// Random weights for every tensor a real checkpoint of this shape carries.
pub fn test_tensors(device: &Device) -> HashMap<String, Tensor> {
    let mut tensors = HashMap::new();

    randn(&mut tensors, "embeddings.word_embeddings.weight", &[VOCAB, HIDDEN], device);
    randn(
        &mut tensors,
        "embeddings.position_embeddings.weight",
        &[MAX_POSITIONS, HIDDEN],
        device,
    );
    randn(
        &mut tensors,
        "embeddings.token_type_embeddings.weight",
        &[2, HIDDEN],
        device,
    );
    layer_norm_params(&mut tensors, "embeddings.LayerNorm", device);

    for layer in 0..LAYERS {
        let prefix = format!("encoder.layer.{layer}");
        for head in ["query", "key", "value"] {
            randn(
                &mut tensors,
                &format!("{prefix}.attention.self.{head}.weight"),
                &[HIDDEN, HIDDEN],
                device,
            );
            randn(
                &mut tensors,
                &format!("{prefix}.attention.self.{head}.bias"),
                &[HIDDEN],
                device,
            );
        }
        randn(
            &mut tensors,
            &format!("{prefix}.attention.output.dense.weight"),
            &[HIDDEN, HIDDEN],
            device,
        );
        randn(
            &mut tensors,
            &format!("{prefix}.attention.output.dense.bias"),
            &[HIDDEN],
            device,
        );
        layer_norm_params(&mut tensors, &format!("{prefix}.attention.output.LayerNorm"), device);

        randn(
            &mut tensors,
            &format!("{prefix}.intermediate.dense.weight"),
            &[INTERMEDIATE, HIDDEN],
            device,
        );
        randn(
            &mut tensors,
            &format!("{prefix}.intermediate.dense.bias"),
            &[INTERMEDIATE],
            device,
        );
        randn(
            &mut tensors,
            &format!("{prefix}.output.dense.weight"),
            &[HIDDEN, INTERMEDIATE],
            device,
        );
        randn(
            &mut tensors,
            &format!("{prefix}.output.dense.bias"),
            &[HIDDEN],
            device,
        );
        layer_norm_params(&mut tensors, &format!("{prefix}.output.LayerNorm"), device);
    }

    randn(&mut tensors, "sparse_linear.weight", &[1, HIDDEN], device);
    randn(&mut tensors, "sparse_linear.bias", &[1], device);
    randn(&mut tensors, "colbert_linear.weight", &[COLBERT_DIM, HIDDEN], device);
    randn(&mut tensors, "colbert_linear.bias", &[COLBERT_DIM], device);

    tensors
}

pub fn test_model(device: &Device) -> M3Model {
    M3Model::from_tensors(CONFIG_JSON, test_tensors(device), device)
        .expect("Failed to build test model")
}

/// Feed dict for `candle_onnx::simple_eval`.
pub fn eval_inputs(input_ids: &Tensor, attention_mask: &Tensor) -> HashMap<String, Tensor> {
    HashMap::from([
        (INPUT_IDS.to_string(), input_ids.clone()),
        (ATTENTION_MASK.to_string(), attention_mask.clone()),
    ])
}

pub fn eval_inputs_from(dummy: &DummyInput) -> HashMap<String, Tensor> {
    eval_inputs(&dummy.input_ids, &dummy.attention_mask)
}

/// Largest absolute elementwise difference between two same-shaped tensors.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    assert_eq!(a.dims(), b.dims(), "shape mismatch: {:?} vs {:?}", a.dims(), b.dims());
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .into_iter()
        .fold(0f32, f32::max)
}
