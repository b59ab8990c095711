use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use candle_onnx::onnx::tensor_proto::DataLocation;
use candle_onnx::onnx::{ModelProto, StringStringEntryProto};
use prost::Message;

/// Tensors below this byte size stay inline; shape vectors and scalar
/// constants are not worth an indirection into the sidecar.
pub const EXTERNAL_SIZE_THRESHOLD: usize = 1024;

/// The project's sidecar name for a primary graph file: the `.onnx` extension
/// is replaced with `.onnx_data`, deliberately distinct from the format's own
/// `<file>.data` default suffix.
pub fn sidecar_name(onnx_path: &Path) -> Result<String> {
    let stem = onnx_path
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("{} has no usable file name", onnx_path.display()))?;
    Ok(format!("{stem}.onnx_data"))
}

/// What the splitter did, for logging and postcondition checks.
#[derive(Debug)]
pub struct ExternalSplit {
    pub sidecar: PathBuf,
    pub tensors_moved: usize,
    pub bytes_moved: u64,
}

/// Re-save a just-traced graph with its parameter bytes consolidated into one
/// external sidecar file.
///
/// `location` is the sidecar's file name, relative to the primary's
/// directory. It is an explicit, required parameter: the save routine never
/// invents a name on its own. Postcondition: the primary file holds topology
/// and metadata only, every tensor at or above the size threshold referencing
/// `{location, offset, length}` in the sidecar.
pub fn split_external(onnx_path: &Path, location: &str) -> Result<ExternalSplit> {
    ensure!(!location.is_empty(), "external data location must not be empty");
    let dir = onnx_path
        .parent()
        .with_context(|| format!("{} has no parent directory", onnx_path.display()))?;

    let bytes = fs::read(onnx_path)
        .with_context(|| format!("Failed to read {}", onnx_path.display()))?;
    let mut model =
        ModelProto::decode(bytes.as_slice()).context("Malformed graph file")?;
    let graph = model
        .graph
        .as_mut()
        .context("Graph file carries no graph")?;

    let mut blob = Vec::new();
    let mut tensors_moved = 0usize;
    for tensor in graph.initializer.iter_mut() {
        if tensor.raw_data.len() < EXTERNAL_SIZE_THRESHOLD {
            continue;
        }
        let data = std::mem::take(&mut tensor.raw_data);
        let offset = blob.len();
        blob.extend_from_slice(&data);
        tensor.external_data = vec![
            entry("location", location),
            entry("offset", &offset.to_string()),
            entry("length", &data.len().to_string()),
        ];
        tensor.data_location = DataLocation::External as i32;
        tensors_moved += 1;
    }
    if tensors_moved == 0 {
        bail!(
            "no tensor in {} reached the {EXTERNAL_SIZE_THRESHOLD}-byte externalization threshold",
            onnx_path.display(),
        );
    }

    let sidecar = dir.join(location);
    let bytes_moved = blob.len() as u64;
    fs::write(&sidecar, &blob)
        .with_context(|| format!("Failed to write {}", sidecar.display()))?;
    fs::write(onnx_path, model.encode_to_vec())
        .with_context(|| format!("Failed to rewrite {}", onnx_path.display()))?;

    tracing::info!(
        tensors = tensors_moved,
        bytes = bytes_moved,
        "Consolidated parameter data into {}",
        sidecar.display(),
    );
    Ok(ExternalSplit {
        sidecar,
        tensors_moved,
        bytes_moved,
    })
}

/// Load an externalized graph and restore every external reference to inline
/// `raw_data`, reading the referenced sidecar file(s) next to the primary.
pub fn read_externalized(onnx_path: &Path) -> Result<ModelProto> {
    let dir = onnx_path
        .parent()
        .with_context(|| format!("{} has no parent directory", onnx_path.display()))?;
    let bytes = fs::read(onnx_path)
        .with_context(|| format!("Failed to read {}", onnx_path.display()))?;
    let mut model =
        ModelProto::decode(bytes.as_slice()).context("Malformed graph file")?;
    let graph = model
        .graph
        .as_mut()
        .context("Graph file carries no graph")?;

    let mut sidecars: HashMap<String, Vec<u8>> = HashMap::new();
    for tensor in graph.initializer.iter_mut() {
        if tensor.data_location != DataLocation::External as i32 {
            continue;
        }
        let location = lookup(&tensor.external_data, "location")
            .with_context(|| format!("Tensor '{}' lacks an external location", tensor.name))?
            .to_string();
        let offset: usize = lookup(&tensor.external_data, "offset")
            .unwrap_or("0")
            .parse()
            .with_context(|| format!("Tensor '{}' has a malformed offset", tensor.name))?;
        let length: usize = lookup(&tensor.external_data, "length")
            .with_context(|| format!("Tensor '{}' lacks an external length", tensor.name))?
            .parse()
            .with_context(|| format!("Tensor '{}' has a malformed length", tensor.name))?;

        let data = match sidecars.entry(location.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = dir.join(entry.key());
                let data = fs::read(&path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                entry.insert(data)
            }
        };
        ensure!(
            offset + length <= data.len(),
            "Tensor '{}' points past the end of {location}",
            tensor.name,
        );
        tensor.raw_data = data[offset..offset + length].to_vec();
        tensor.external_data.clear();
        tensor.data_location = DataLocation::Default as i32;
    }
    Ok(model)
}

fn entry(key: &str, value: &str) -> StringStringEntryProto {
    StringStringEntryProto {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn lookup<'a>(entries: &'a [StringStringEntryProto], key: &str) -> Option<&'a str> {
    entries
        .iter()
        .find(|e| e.key == key)
        .map(|e| e.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_name_swaps_the_extension() {
        let name = sidecar_name(Path::new("out/model.onnx")).unwrap();
        assert_eq!(name, "model.onnx_data");
    }

    #[test]
    fn split_requires_a_location() {
        let err = split_external(Path::new("out/model.onnx"), "").unwrap_err();
        assert!(err.to_string().contains("location"));
    }
}
