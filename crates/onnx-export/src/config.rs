use std::path::PathBuf;

/// Everything the export entry point needs, passed explicitly.
///
/// There is intentionally no global or environment-derived state here; the
/// binary builds one of these from its arguments and defaults.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Directory containing `config.json` and `model.safetensors`.
    pub model_source: PathBuf,
    /// Sequence length of the tracing dummy input.
    pub sequence_length: usize,
    /// Batch size of the tracing dummy input.
    pub batch_size: usize,
    /// Exclusive upper bound for random dummy token ids. Clamped to the
    /// model's vocabulary size at export time.
    pub vocabulary_bound: u32,
    /// ONNX operator set version to stamp into the artifact.
    pub opset_version: i64,
    /// Directory the artifacts are written to.
    pub output_path: PathBuf,
}

impl ExportConfig {
    pub const DEFAULT_SEQUENCE_LENGTH: usize = 512;
    pub const DEFAULT_BATCH_SIZE: usize = 1;
    pub const DEFAULT_VOCABULARY_BOUND: u32 = 1000;
    pub const DEFAULT_OPSET_VERSION: i64 = 14;

    /// Config with the standard tracing shape `(1, 512)` and opset.
    pub fn new(model_source: PathBuf, output_path: PathBuf) -> Self {
        Self {
            model_source,
            sequence_length: Self::DEFAULT_SEQUENCE_LENGTH,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            vocabulary_bound: Self::DEFAULT_VOCABULARY_BOUND,
            opset_version: Self::DEFAULT_OPSET_VERSION,
            output_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_standard_tracing_shape() {
        let config = ExportConfig::new(PathBuf::from("model"), PathBuf::from("out"));
        assert_eq!(config.sequence_length, 512);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.vocabulary_bound, 1000);
        assert_eq!(config.opset_version, 14);
    }
}
