#![deny(clippy::all)]

//! Export pipeline turning the multi-output embedding model into a
//! single-output ONNX artifact with externalized weights.
//!
//! The flow is strictly sequential: wrap the model down to its dense head,
//! generate a fixed-shape dummy input, trace the frozen computation into a
//! static graph, split the parameter bytes out into one sidecar file, then
//! verify the artifact set and sweep the stale default-suffix file.

mod config;
mod dummy;
mod external;
mod finalize;
mod graph;
mod pipeline;
mod trace;
mod wrapper;

pub use config::ExportConfig;
pub use dummy::{DummyInput, DynamicAxes};
pub use external::{read_externalized, sidecar_name, split_external, ExternalSplit};
pub use finalize::{default_external_name, finalize, FinalizeReport};
pub use graph::DimSpec;
pub use pipeline::{export, MODEL_FILE_NAME};
pub use trace::{save, trace, ATTENTION_MASK, DENSE_OUTPUT, INPUT_IDS};
pub use wrapper::DenseWrapper;
