use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor};
use rand::Rng;

use crate::graph::DimSpec;
use crate::trace::{ATTENTION_MASK, DENSE_OUTPUT, INPUT_IDS};

/// Synthetic tracing input: random token ids plus an all-ones attention mask.
///
/// Only exists to drive one forward pass through the tracer; nothing of it
/// ends up in the persisted artifact.
pub struct DummyInput {
    /// Shape `(batch, seq_len)`, i64, values in `[0, vocabulary_bound)`.
    pub input_ids: Tensor,
    /// Shape `(batch, seq_len)`, i64, all ones.
    pub attention_mask: Tensor,
}

impl DummyInput {
    pub fn generate(
        batch: usize,
        seq_len: usize,
        vocabulary_bound: u32,
        device: &Device,
    ) -> Result<Self> {
        ensure!(batch >= 1, "dummy batch size must be at least 1");
        ensure!(seq_len >= 1, "dummy sequence length must be at least 1");
        ensure!(vocabulary_bound >= 1, "vocabulary bound must be at least 1");

        let mut rng = rand::rng();
        let ids: Vec<i64> = (0..batch * seq_len)
            .map(|_| rng.random_range(0..vocabulary_bound as i64))
            .collect();
        let input_ids = Tensor::from_vec(ids, (batch, seq_len), device)?;
        let attention_mask = Tensor::ones((batch, seq_len), DType::I64, device)?;
        Ok(Self {
            input_ids,
            attention_mask,
        })
    }

    pub fn batch(&self) -> usize {
        self.input_ids.dims()[0]
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.dims()[1]
    }
}

/// Which dimensions of each graph input/output stay symbolic in the artifact.
///
/// Tracing runs with one fixed-shape input; any dimension not declared here
/// gets baked into the graph at its traced value. Omitting a declaration is a
/// silent correctness bug (the artifact would reject or mishandle every
/// other input shape), so the pipeline always passes an explicit set.
pub struct DynamicAxes {
    specs: Vec<(String, Vec<(usize, String)>)>,
}

impl DynamicAxes {
    /// The standard declaration: batch dimension dynamic on both inputs and
    /// the output, sequence-length dimension dynamic on both inputs.
    pub fn standard() -> Self {
        let batch = |idx: usize| (idx, "batch_size".to_string());
        let seq = |idx: usize| (idx, "sequence_length".to_string());
        Self {
            specs: vec![
                (INPUT_IDS.to_string(), vec![batch(0), seq(1)]),
                (ATTENTION_MASK.to_string(), vec![batch(0), seq(1)]),
                (DENSE_OUTPUT.to_string(), vec![batch(0)]),
            ],
        }
    }

    /// Resolve a tensor's dims: symbolic where declared, fixed at the traced
    /// value everywhere else.
    pub fn dims_for(&self, tensor: &str, traced: &[usize]) -> Vec<DimSpec> {
        let dynamic = self
            .specs
            .iter()
            .find(|(name, _)| name == tensor)
            .map(|(_, axes)| axes.as_slice())
            .unwrap_or(&[]);
        traced
            .iter()
            .enumerate()
            .map(|(idx, value)| {
                match dynamic.iter().find(|(axis, _)| *axis == idx) {
                    Some((_, label)) => DimSpec::Symbolic(label.clone()),
                    None => DimSpec::Fixed(*value as i64),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_input_has_requested_shape_and_bounds() {
        let device = Device::Cpu;
        let dummy = DummyInput::generate(1, 16, 10, &device).expect("Failed to generate");
        assert_eq!(dummy.input_ids.dims(), &[1, 16]);
        assert_eq!(dummy.attention_mask.dims(), &[1, 16]);
        assert_eq!(dummy.input_ids.dtype(), DType::I64);

        let ids = dummy.input_ids.flatten_all().unwrap().to_vec1::<i64>().unwrap();
        assert!(ids.iter().all(|&id| (0..10).contains(&id)));
        let mask = dummy
            .attention_mask
            .flatten_all()
            .unwrap()
            .to_vec1::<i64>()
            .unwrap();
        assert!(mask.iter().all(|&m| m == 1));
    }

    #[test]
    fn rejects_empty_shapes() {
        let device = Device::Cpu;
        assert!(DummyInput::generate(0, 16, 10, &device).is_err());
        assert!(DummyInput::generate(1, 0, 10, &device).is_err());
    }

    #[test]
    fn standard_axes_keep_batch_and_sequence_symbolic() {
        let axes = DynamicAxes::standard();
        let dims = axes.dims_for(INPUT_IDS, &[1, 512]);
        assert!(matches!(dims[0], DimSpec::Symbolic(ref l) if l == "batch_size"));
        assert!(matches!(dims[1], DimSpec::Symbolic(ref l) if l == "sequence_length"));

        let out = axes.dims_for(DENSE_OUTPUT, &[1, 384]);
        assert!(matches!(out[0], DimSpec::Symbolic(ref l) if l == "batch_size"));
        assert!(matches!(out[1], DimSpec::Fixed(384)));
    }
}
