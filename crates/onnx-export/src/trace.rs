use std::fs;
use std::ops::RangeInclusive;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use candle_core::DType;
use candle_onnx::onnx::tensor_proto::DataType;
use candle_onnx::onnx::{GraphProto, ModelProto, OperatorSetIdProto};
use embedder::{Invokable, M3Model};
use prost::Message;

use crate::dummy::{DummyInput, DynamicAxes};
use crate::graph::{attr_int, attr_ints, tensor_value_info, GraphBuilder};
use crate::wrapper::DenseWrapper;

pub const INPUT_IDS: &str = "input_ids";
pub const ATTENTION_MASK: &str = "attention_mask";
pub const DENSE_OUTPUT: &str = "dense_embeddings";

/// Opset window the lowering can express: axes-as-input `Unsqueeze`/`Slice`,
/// axes-as-attribute reductions, decomposed layer norm.
pub const SUPPORTED_OPSETS: RangeInclusive<i64> = 13..=17;

const IR_VERSION: i64 = 7;
const GRAPH_NAME: &str = "dense_embedder";

/// Protobuf encodings cap out at 2 GiB, so the inline save alone cannot hold
/// arbitrarily large checkpoints; the external-data split removes the limit.
const INLINE_ENCODING_CEILING: usize = i32::MAX as usize;

/// Freeze the wrapper's forward computation into a static ONNX graph.
///
/// The dummy input drives one real forward pass first, which validates input
/// dtype/shape against the model and pins the output width. After that the
/// encoder is lowered layer by layer with the checkpoint's current parameter
/// values embedded as initializers. Graph inputs keep the names the inference
/// side expects (`input_ids`, `attention_mask`); the single output is
/// `dense_embeddings`.
pub fn trace(
    wrapper: &DenseWrapper,
    dummy: &DummyInput,
    axes: &DynamicAxes,
    opset_version: i64,
) -> Result<ModelProto> {
    ensure!(
        SUPPORTED_OPSETS.contains(&opset_version),
        "opset {opset_version} cannot express this model's operations \
         (supported: {} through {})",
        SUPPORTED_OPSETS.start(),
        SUPPORTED_OPSETS.end(),
    );
    ensure!(
        dummy.input_ids.dtype() == DType::I64 && dummy.attention_mask.dtype() == DType::I64,
        "dummy inputs must be i64, got {:?}/{:?}",
        dummy.input_ids.dtype(),
        dummy.attention_mask.dtype(),
    );

    let probe = wrapper
        .invoke(&dummy.input_ids, &dummy.attention_mask)
        .context("Tracing forward pass failed")?;
    ensure!(
        probe.dims().len() == 2 && probe.dims()[0] == dummy.batch(),
        "traced output has shape {:?}, expected (batch={}, hidden)",
        probe.dims(),
        dummy.batch(),
    );

    let model = wrapper.model();
    let hidden = model.config().hidden_size;
    ensure!(
        probe.dims()[1] == hidden,
        "traced output width {} differs from encoder hidden size {hidden}",
        probe.dims()[1],
    );

    let graph = lower(model, dummy, axes)?;
    tracing::info!(
        nodes = graph.node.len(),
        initializers = graph.initializer.len(),
        "Traced model into a static graph"
    );

    Ok(ModelProto {
        ir_version: IR_VERSION,
        opset_import: vec![OperatorSetIdProto {
            domain: String::new(),
            version: opset_version,
        }],
        producer_name: env!("CARGO_PKG_NAME").to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph),
        ..Default::default()
    })
}

/// Serialize with all parameters inline. This is the splitter's input, not
/// the final artifact.
pub fn save(model: &ModelProto, path: &Path) -> Result<()> {
    let bytes = model.encode_to_vec();
    if bytes.len() > INLINE_ENCODING_CEILING {
        bail!(
            "encoded graph is {} bytes, above the 2 GiB inline protobuf ceiling; \
             the checkpoint cannot be saved with embedded parameters",
            bytes.len(),
        );
    }
    fs::write(path, &bytes).with_context(|| format!("Failed to write {}", path.display()))
}

fn lower(model: &M3Model, dummy: &DummyInput, axes: &DynamicAxes) -> Result<GraphProto> {
    let mut lowering = Lowering::new(model);
    lowering.emit_model()?;

    let config = model.config();
    let inputs = vec![
        tensor_value_info(
            INPUT_IDS,
            DataType::Int64,
            &axes.dims_for(INPUT_IDS, &[dummy.batch(), dummy.seq_len()]),
        ),
        tensor_value_info(
            ATTENTION_MASK,
            DataType::Int64,
            &axes.dims_for(ATTENTION_MASK, &[dummy.batch(), dummy.seq_len()]),
        ),
    ];
    let outputs = vec![tensor_value_info(
        DENSE_OUTPUT,
        DataType::Float,
        &axes.dims_for(DENSE_OUTPUT, &[dummy.batch(), config.hidden_size]),
    )];
    Ok(lowering.builder.finish(GRAPH_NAME, inputs, outputs))
}

/// Walks the encoder and emits nodes in evaluation order, holding on to the
/// constants and runtime shape scalars every layer shares.
struct Lowering<'m> {
    builder: GraphBuilder,
    model: &'m M3Model,
    zero_1d: String,
    index_zero: String,
    one_f: String,
    half_f: String,
    sqrt2_f: String,
    scale_f: String,
    eps_f: String,
    width_f: String,
    seq_dim: String,
    split_shape: String,
    merge_shape: String,
    mask_bias: String,
}

impl<'m> Lowering<'m> {
    fn new(model: &'m M3Model) -> Self {
        let mut builder = GraphBuilder::new();
        let config = model.config();
        let heads = config.num_attention_heads as i64;
        let head_dim = config.head_dim() as i64;
        let hidden = config.hidden_size as i64;

        let zero_1d = builder.int64_consts("const_zero", &[0]);
        let one_1d = builder.int64_consts("const_one", &[1]);
        let two_1d = builder.int64_consts("const_two", &[2]);
        let index_zero = builder.int64_scalar("index_zero", 0);
        let heads_1d = builder.int64_consts("num_heads", &[heads]);
        let head_dim_1d = builder.int64_consts("head_dim", &[head_dim]);
        let hidden_1d = builder.int64_consts("hidden_size", &[hidden]);
        let one_f = builder.float_consts("const_one_f", &[1.0]);
        let half_f = builder.float_consts("const_half_f", &[0.5]);
        let sqrt2_f = builder.float_consts("const_sqrt2_f", &[std::f32::consts::SQRT_2]);
        let mask_fill_f = builder.float_consts("mask_fill", &[f32::MIN]);
        let scale_f = builder.float_consts("attention_scale", &[(head_dim as f32).sqrt()]);
        let eps_f = builder.float_consts("layer_norm_eps", &[config.layer_norm_eps as f32]);
        let width_f = builder.float_consts("dense_width", &[config.hidden_size as f32]);

        // Batch and sequence length as runtime scalars, so every reshape in
        // the graph follows the actual input shape instead of the traced one.
        let shape = builder.emit("Shape", &[INPUT_IDS], vec![]);
        let batch_dim = builder.emit("Slice", &[&shape, &zero_1d, &one_1d, &zero_1d], vec![]);
        let seq_dim = builder.emit("Slice", &[&shape, &one_1d, &two_1d, &zero_1d], vec![]);
        let split_shape = builder.emit(
            "Concat",
            &[&batch_dim, &seq_dim, &heads_1d, &head_dim_1d],
            vec![attr_int("axis", 0)],
        );
        let merge_shape = builder.emit(
            "Concat",
            &[&batch_dim, &seq_dim, &hidden_1d],
            vec![attr_int("axis", 0)],
        );

        // Additive attention bias: 0 where the mask keeps a token, a large
        // negative fill where it pads one. Broadcast as (batch, 1, 1, seq).
        let mask_f = builder.emit(
            "Cast",
            &[ATTENTION_MASK],
            vec![attr_int("to", DataType::Float as i64)],
        );
        let inverted = builder.emit("Sub", &[&one_f, &mask_f], vec![]);
        let filled = builder.emit("Mul", &[&inverted, &mask_fill_f], vec![]);
        let bias_3d = builder.emit("Unsqueeze", &[&filled, &one_1d], vec![]);
        let mask_bias = builder.emit("Unsqueeze", &[&bias_3d, &two_1d], vec![]);

        Self {
            builder,
            model,
            zero_1d,
            index_zero,
            one_f,
            half_f,
            sqrt2_f,
            scale_f,
            eps_f,
            width_f,
            seq_dim,
            split_shape,
            merge_shape,
            mask_bias,
        }
    }

    fn emit_model(&mut self) -> Result<()> {
        let mut hidden = self.emit_embeddings()?;
        for layer in 0..self.model.config().num_hidden_layers {
            hidden = self.emit_layer(&hidden, layer)?;
        }
        self.emit_dense_head(&hidden)
    }

    /// Word + token-type + position embeddings, then layer norm. All tokens
    /// share token type 0, so its embedding collapses to one broadcast row.
    fn emit_embeddings(&mut self) -> Result<String> {
        let word = self.weight_init("embeddings.word_embeddings.weight")?;
        let token_type = self.weight_init("embeddings.token_type_embeddings.weight")?;
        let position = self.weight_init("embeddings.position_embeddings.weight")?;

        let gathered = self
            .builder
            .emit("Gather", &[&word, INPUT_IDS], vec![attr_int("axis", 0)]);
        let type_row = self.builder.emit(
            "Gather",
            &[&token_type, &self.index_zero],
            vec![attr_int("axis", 0)],
        );
        let with_type = self.builder.emit("Add", &[&gathered, &type_row], vec![]);

        let position_rows = self.builder.emit(
            "Slice",
            &[&position, &self.zero_1d, &self.seq_dim, &self.zero_1d],
            vec![],
        );
        let summed = self
            .builder
            .emit("Add", &[&with_type, &position_rows], vec![]);
        self.layer_norm(&summed, "embeddings.LayerNorm")
    }

    fn emit_layer(&mut self, input: &str, layer: usize) -> Result<String> {
        let prefix = format!("encoder.layer.{layer}");

        let attended = self.emit_attention(input, &prefix)?;
        let projected = self.linear(&attended, &format!("{prefix}.attention.output.dense"))?;
        let residual = self.builder.emit("Add", &[&projected, input], vec![]);
        let hidden = self.layer_norm(&residual, &format!("{prefix}.attention.output.LayerNorm"))?;

        let intermediate = self.linear(&hidden, &format!("{prefix}.intermediate.dense"))?;
        let activated = self.gelu(&intermediate);
        let output = self.linear(&activated, &format!("{prefix}.output.dense"))?;
        let residual = self.builder.emit("Add", &[&output, &hidden], vec![]);
        self.layer_norm(&residual, &format!("{prefix}.output.LayerNorm"))
    }

    /// Multi-head self-attention over `(batch, seq, hidden)`.
    fn emit_attention(&mut self, input: &str, prefix: &str) -> Result<String> {
        let query = self.linear(input, &format!("{prefix}.attention.self.query"))?;
        let key = self.linear(input, &format!("{prefix}.attention.self.key"))?;
        let value = self.linear(input, &format!("{prefix}.attention.self.value"))?;

        let query = self.split_heads(&query);
        let key = self.split_heads(&key);
        let value = self.split_heads(&value);

        let key_t = self
            .builder
            .emit("Transpose", &[&key], vec![attr_ints("perm", &[0, 1, 3, 2])]);
        let scores = self.builder.emit("MatMul", &[&query, &key_t], vec![]);
        let scaled = self.builder.emit("Div", &[&scores, &self.scale_f], vec![]);
        let masked = self.builder.emit("Add", &[&scaled, &self.mask_bias], vec![]);
        let probs = self
            .builder
            .emit("Softmax", &[&masked], vec![attr_int("axis", -1)]);
        let context = self.builder.emit("MatMul", &[&probs, &value], vec![]);

        let context = self.builder.emit(
            "Transpose",
            &[&context],
            vec![attr_ints("perm", &[0, 2, 1, 3])],
        );
        Ok(self
            .builder
            .emit("Reshape", &[&context, &self.merge_shape], vec![]))
    }

    /// `(batch, seq, hidden)` -> `(batch, heads, seq, head_dim)`.
    fn split_heads(&mut self, input: &str) -> String {
        let split = self
            .builder
            .emit("Reshape", &[input, &self.split_shape], vec![]);
        self.builder
            .emit("Transpose", &[&split], vec![attr_ints("perm", &[0, 2, 1, 3])])
    }

    /// Linear layer as `MatMul` + `Add`, with the weight pre-transposed at
    /// export time so no runtime transpose is needed.
    fn linear(&mut self, input: &str, prefix: &str) -> Result<String> {
        let weight = self.model.weight(&format!("{prefix}.weight"))?;
        let weight_t = weight.t()?;
        let weight_t = self
            .builder
            .float_tensor(&format!("{prefix}.weight_t"), &weight_t)?;
        let bias = self.weight_init(&format!("{prefix}.bias"))?;
        let product = self.builder.emit("MatMul", &[input, &weight_t], vec![]);
        Ok(self.builder.emit("Add", &[&product, &bias], vec![]))
    }

    /// Layer norm decomposed into reduce/arithmetic primitives.
    fn layer_norm(&mut self, input: &str, prefix: &str) -> Result<String> {
        let gamma = self.weight_init(&format!("{prefix}.weight"))?;
        let beta = self.weight_init(&format!("{prefix}.bias"))?;

        let reduce_attrs = || vec![attr_ints("axes", &[-1]), attr_int("keepdims", 1)];
        let mean = self.builder.emit("ReduceMean", &[input], reduce_attrs());
        let centered = self.builder.emit("Sub", &[input, &mean], vec![]);
        let squared = self.builder.emit("Mul", &[&centered, &centered], vec![]);
        let variance = self.builder.emit("ReduceMean", &[&squared], reduce_attrs());
        let shifted = self.builder.emit("Add", &[&variance, &self.eps_f], vec![]);
        let denom = self.builder.emit("Sqrt", &[&shifted], vec![]);
        let normed = self.builder.emit("Div", &[&centered, &denom], vec![]);
        let scaled = self.builder.emit("Mul", &[&normed, &gamma], vec![]);
        Ok(self.builder.emit("Add", &[&scaled, &beta], vec![]))
    }

    /// Exact (erf-based) GELU: `0.5 * x * (1 + erf(x / sqrt(2)))`.
    fn gelu(&mut self, input: &str) -> String {
        let scaled = self.builder.emit("Div", &[input, &self.sqrt2_f], vec![]);
        let erf = self.builder.emit("Erf", &[&scaled], vec![]);
        let shifted = self.builder.emit("Add", &[&erf, &self.one_f], vec![]);
        let product = self.builder.emit("Mul", &[input, &shifted], vec![]);
        self.builder.emit("Mul", &[&product, &self.half_f], vec![])
    }

    /// `[CLS]` extraction plus L2 normalization. The norm comes out of the
    /// mean of squares scaled by the vector width, staying within the reduce
    /// ops already used elsewhere in the graph.
    fn emit_dense_head(&mut self, hidden: &str) -> Result<()> {
        let cls = self.builder.emit(
            "Gather",
            &[hidden, &self.index_zero],
            vec![attr_int("axis", 1)],
        );
        let squared = self.builder.emit("Mul", &[&cls, &cls], vec![]);
        let mean = self.builder.emit(
            "ReduceMean",
            &[&squared],
            vec![attr_ints("axes", &[-1]), attr_int("keepdims", 1)],
        );
        let sum = self.builder.emit("Mul", &[&mean, &self.width_f], vec![]);
        let norm = self.builder.emit("Sqrt", &[&sum], vec![]);
        self.builder
            .emit_named("Div", &[&cls, &norm], DENSE_OUTPUT, vec![]);
        Ok(())
    }

    /// Embed a checkpoint tensor as an initializer under its own name.
    fn weight_init(&mut self, name: &str) -> Result<String> {
        let tensor = self.model.weight(name)?;
        self.builder.float_tensor(name, tensor)
    }
}
