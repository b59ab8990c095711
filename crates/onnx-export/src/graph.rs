use anyhow::Result;
use candle_core::{DType, Tensor};
use candle_onnx::onnx::tensor_proto::DataType;
use candle_onnx::onnx::tensor_shape_proto::{dimension, Dimension};
use candle_onnx::onnx::{
    attribute_proto::AttributeType, type_proto, AttributeProto, GraphProto, NodeProto,
    TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
};

/// One dimension of a graph input/output: fixed to a value, or left symbolic
/// so the artifact accepts other sizes at inference time.
#[derive(Debug, Clone)]
pub enum DimSpec {
    Fixed(i64),
    Symbolic(String),
}

/// Typed tensor declaration for the graph's input/output lists.
pub fn tensor_value_info(name: &str, elem_type: DataType, dims: &[DimSpec]) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|spec| Dimension {
            denotation: String::new(),
            value: Some(match spec {
                DimSpec::Fixed(v) => dimension::Value::DimValue(*v),
                DimSpec::Symbolic(label) => dimension::Value::DimParam(label.clone()),
            }),
        })
        .collect();
    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            denotation: String::new(),
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
        }),
        doc_string: String::new(),
    }
}

pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i: value,
        ..Default::default()
    }
}

pub fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: values.to_vec(),
        ..Default::default()
    }
}

/// Accumulates nodes and initializers while the tracer lowers the model.
///
/// Intermediate value names are generated from a short stem plus a running
/// counter, so every edge in the graph is unique without the tracer having to
/// thread naming state around.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    counter: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self, stem: &str) -> String {
        let name = format!("{stem}_{}", self.counter);
        self.counter += 1;
        name
    }

    /// Append a single-output node; returns the generated output name.
    pub fn emit(&mut self, op_type: &str, inputs: &[&str], attributes: Vec<AttributeProto>) -> String {
        let output = self.fresh(&op_type.to_lowercase());
        self.emit_named(op_type, inputs, &output, attributes);
        output
    }

    /// Append a single-output node with a caller-chosen output name.
    pub fn emit_named(
        &mut self,
        op_type: &str,
        inputs: &[&str],
        output: &str,
        attributes: Vec<AttributeProto>,
    ) {
        self.nodes.push(NodeProto {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.to_string()],
            name: output.to_string(),
            op_type: op_type.to_string(),
            attribute: attributes,
            ..Default::default()
        });
    }

    /// Add a float initializer carrying a parameter tensor's bytes.
    pub fn float_tensor(&mut self, name: &str, tensor: &Tensor) -> Result<String> {
        let dims = tensor.dims().iter().map(|d| *d as i64).collect();
        let values = tensor
            .to_dtype(DType::F32)?
            .contiguous()?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let mut raw_data = Vec::with_capacity(values.len() * 4);
        for v in &values {
            raw_data.extend_from_slice(&v.to_le_bytes());
        }
        self.initializers.push(TensorProto {
            dims,
            data_type: DataType::Float as i32,
            name: name.to_string(),
            raw_data,
            ..Default::default()
        });
        Ok(name.to_string())
    }

    /// Add a small rank-1 float constant.
    pub fn float_consts(&mut self, name: &str, values: &[f32]) -> String {
        let mut raw_data = Vec::with_capacity(values.len() * 4);
        for v in values {
            raw_data.extend_from_slice(&v.to_le_bytes());
        }
        self.initializers.push(TensorProto {
            dims: vec![values.len() as i64],
            data_type: DataType::Float as i32,
            name: name.to_string(),
            raw_data,
            ..Default::default()
        });
        name.to_string()
    }

    /// Add a small rank-1 int64 constant (shape vectors, slice bounds, axes).
    pub fn int64_consts(&mut self, name: &str, values: &[i64]) -> String {
        let mut raw_data = Vec::with_capacity(values.len() * 8);
        for v in values {
            raw_data.extend_from_slice(&v.to_le_bytes());
        }
        self.initializers.push(TensorProto {
            dims: vec![values.len() as i64],
            data_type: DataType::Int64 as i32,
            name: name.to_string(),
            raw_data,
            ..Default::default()
        });
        name.to_string()
    }

    /// Add a rank-0 int64 constant (scalar gather indices).
    pub fn int64_scalar(&mut self, name: &str, value: i64) -> String {
        self.initializers.push(TensorProto {
            dims: vec![],
            data_type: DataType::Int64 as i32,
            name: name.to_string(),
            raw_data: value.to_le_bytes().to_vec(),
            ..Default::default()
        });
        name.to_string()
    }

    pub fn finish(
        self,
        name: &str,
        inputs: Vec<ValueInfoProto>,
        outputs: Vec<ValueInfoProto>,
    ) -> GraphProto {
        GraphProto {
            node: self.nodes,
            name: name.to_string(),
            initializer: self.initializers,
            input: inputs,
            output: outputs,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitted_value_names_are_unique() {
        let mut builder = GraphBuilder::new();
        let a = builder.emit("Add", &["x", "y"], vec![]);
        let b = builder.emit("Add", &["x", "y"], vec![]);
        assert_ne!(a, b);
    }

    #[test]
    fn value_info_mixes_fixed_and_symbolic_dims() {
        let info = tensor_value_info(
            "input_ids",
            DataType::Int64,
            &[
                DimSpec::Symbolic("batch_size".to_string()),
                DimSpec::Fixed(512),
            ],
        );
        let Some(type_proto::Value::TensorType(tensor)) = info.r#type.unwrap().value else {
            panic!("expected a tensor type");
        };
        let dims = tensor.shape.unwrap().dim;
        assert!(matches!(
            dims[0].value,
            Some(dimension::Value::DimParam(ref label)) if label == "batch_size"
        ));
        assert!(matches!(dims[1].value, Some(dimension::Value::DimValue(512))));
    }

    #[test]
    fn int64_scalar_is_rank_zero() {
        let mut builder = GraphBuilder::new();
        builder.int64_scalar("zero", 0);
        let graph = builder.finish("g", vec![], vec![]);
        assert!(graph.initializer[0].dims.is_empty());
        assert_eq!(graph.initializer[0].raw_data.len(), 8);
    }
}
