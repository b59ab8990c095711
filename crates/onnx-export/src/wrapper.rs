use anyhow::{Context, Result};
use candle_core::Tensor;
use embedder::{HeadSelection, Invokable, M3Model};

/// Adapter narrowing the model's multi-headed output to the dense vector.
///
/// The ONNX exporter needs a single-output forward pass; the wrapper requests
/// only the dense head, so the sparse and colbert heads are never computed
/// and never enter the traced graph. Construction forces evaluation mode on
/// the underlying model, and the shared borrow held afterwards keeps anyone
/// from toggling it back for the lifetime of the export.
pub struct DenseWrapper<'m> {
    model: &'m M3Model,
}

impl<'m> DenseWrapper<'m> {
    pub fn new(model: &'m mut M3Model) -> Self {
        model.set_train(false);
        Self { model }
    }

    pub fn model(&self) -> &M3Model {
        self.model
    }
}

impl Invokable for DenseWrapper<'_> {
    /// Exactly one tensor: the dense embedding, shape `(batch, hidden)`.
    type Output = Tensor;

    fn invoke(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let output = self
            .model
            .forward_with(input_ids, attention_mask, HeadSelection::dense_only())?;
        output.dense.context("Model produced no dense output")
    }
}
