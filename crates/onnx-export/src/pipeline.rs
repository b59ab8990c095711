use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use embedder::{Loadable, M3Model};

use crate::config::ExportConfig;
use crate::dummy::{DummyInput, DynamicAxes};
use crate::external::{sidecar_name, split_external};
use crate::finalize::finalize;
use crate::trace::{save, trace};
use crate::wrapper::DenseWrapper;

/// File name of the primary graph artifact inside the output directory.
pub const MODEL_FILE_NAME: &str = "model.onnx";

/// Run the whole export: load, wrap, trace, save, split, finalize.
///
/// Strictly sequential; every stage either succeeds or fails the run with the
/// underlying error. Returns the path of the primary graph file; the weight
/// sidecar sits next to it.
pub fn export(config: &ExportConfig) -> Result<PathBuf> {
    fs::create_dir_all(&config.output_path).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.output_path.display()
        )
    })?;

    let device = Device::Cpu;
    let mut model = M3Model::load(&config.model_source, &device)?;

    // Random ids above the vocabulary would make the embedding gather blow up
    // mid-trace, so the configured bound is clamped to what the model knows.
    let vocabulary_bound = config
        .vocabulary_bound
        .min(model.config().vocab_size as u32);
    let dummy = DummyInput::generate(
        config.batch_size,
        config.sequence_length,
        vocabulary_bound,
        &device,
    )?;
    let axes = DynamicAxes::standard();

    tracing::info!("Exporting model to ONNX...");
    let wrapper = DenseWrapper::new(&mut model);
    let traced = trace(&wrapper, &dummy, &axes, config.opset_version)?;

    let onnx_path = config.output_path.join(MODEL_FILE_NAME);
    save(&traced, &onnx_path)?;

    let location = sidecar_name(&onnx_path)?;
    split_external(&onnx_path, &location)?;
    finalize(&onnx_path, &location)?;

    tracing::info!("Model exported to: {}", onnx_path.display());
    Ok(onnx_path)
}
