use std::fs;
use std::path::Path;

use anyhow::{ensure, Context, Result};

/// The sidecar name the format's own save routines derive when asked to
/// externalize data: the full primary file name plus a fixed `.data` suffix
/// (`model.onnx` -> `model.onnx.data`).
pub fn default_external_name(onnx_path: &Path) -> Result<String> {
    let file_name = onnx_path
        .file_name()
        .and_then(|s| s.to_str())
        .with_context(|| format!("{} has no usable file name", onnx_path.display()))?;
    Ok(format!("{file_name}.data"))
}

#[derive(Debug)]
pub struct FinalizeReport {
    /// Whether a stale default-suffix weight file was found and deleted.
    pub removed_stale: bool,
}

/// Verify the artifact set and sweep the stale default-suffix weight file.
///
/// Earlier exporters (and the format's own externalization default) leave a
/// second weight-bearing file named `<primary>.data` next to the artifact.
/// That duplicate is deleted, but only after comparing names: under a
/// different naming choice the default name and the intended sidecar could
/// coincide, and the legitimate sidecar must never be removed. The primary
/// graph file is never a deletion candidate.
///
/// Idempotent: calling this twice, or with no stale file present, changes
/// nothing and raises no error.
pub fn finalize(onnx_path: &Path, sidecar_name: &str) -> Result<FinalizeReport> {
    ensure!(
        onnx_path.is_file(),
        "primary graph file {} is missing",
        onnx_path.display(),
    );
    let dir = onnx_path
        .parent()
        .with_context(|| format!("{} has no parent directory", onnx_path.display()))?;

    let sidecar = dir.join(sidecar_name);
    let sidecar_meta = fs::metadata(&sidecar)
        .with_context(|| format!("intended sidecar {} is missing", sidecar.display()))?;
    ensure!(
        sidecar_meta.len() > 0,
        "intended sidecar {} is empty",
        sidecar.display(),
    );

    let stale_name = default_external_name(onnx_path)?;
    if stale_name == sidecar_name {
        // The requested sidecar happens to use the default name; nothing to
        // sweep without deleting the real weight data.
        return Ok(FinalizeReport {
            removed_stale: false,
        });
    }

    let stale = dir.join(&stale_name);
    if !stale.exists() {
        return Ok(FinalizeReport {
            removed_stale: false,
        });
    }
    fs::remove_file(&stale)
        .with_context(|| format!("Failed to delete stale weight file {}", stale.display()))?;
    tracing::info!("Deleted stale weight file {}", stale.display());
    Ok(FinalizeReport {
        removed_stale: true,
    })
}
