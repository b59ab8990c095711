#![deny(clippy::all)]

mod config;
mod model;

pub use config::EncoderConfig;
pub use model::{EmbeddingOutput, HeadSelection, M3Model};

use std::path::Path;

use anyhow::Result;
use candle_core::{Device, Tensor};

/// Capability to produce a model from a source identifier.
///
/// The source is a directory containing `config.json` and `model.safetensors`;
/// what the directory points at (local checkout, mounted cache, ...) is the
/// caller's concern.
pub trait Loadable: Sized {
    fn load(source: &Path, device: &Device) -> Result<Self>;
}

/// Capability to run a forward pass over tokenized input.
///
/// `input_ids` and `attention_mask` are integer tensors of identical shape
/// `(batch, sequence_length)`. Implementations differ in what they return:
/// the full model yields every output head, an adapter may narrow that down.
pub trait Invokable {
    type Output;

    fn invoke(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Self::Output>;
}
