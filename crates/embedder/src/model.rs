use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{Dropout, Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config};

use crate::config::EncoderConfig;
use crate::{Invokable, Loadable};

const SPARSE_HEAD: &str = "sparse_linear";
const COLBERT_HEAD: &str = "colbert_linear";

/// Which output heads a forward pass should compute.
///
/// Mirrors the embedder's `return_dense` / `return_sparse` / `return_colbert_vecs`
/// switches: a head that is not requested is never computed, which matters both
/// for inference cost and for keeping the traced export graph single-output.
#[derive(Debug, Clone, Copy)]
pub struct HeadSelection {
    pub dense: bool,
    pub sparse: bool,
    pub colbert: bool,
}

impl HeadSelection {
    pub fn all() -> Self {
        Self {
            dense: true,
            sparse: true,
            colbert: true,
        }
    }

    pub fn dense_only() -> Self {
        Self {
            dense: true,
            sparse: false,
            colbert: false,
        }
    }
}

impl Default for HeadSelection {
    fn default() -> Self {
        Self::all()
    }
}

/// Output heads of a forward pass. A head that was not requested is `None`.
#[derive(Debug)]
pub struct EmbeddingOutput {
    /// L2-normalized `[CLS]` vector, shape `(batch, hidden)`.
    pub dense: Option<Tensor>,
    /// Per-token lexical weights, shape `(batch, seq_len)`.
    pub sparse: Option<Tensor>,
    /// Normalized per-token vectors, shape `(batch, seq_len, colbert_dim)`.
    pub colbert: Option<Tensor>,
}

/// M3-style embedding model: a BERT encoder with dense, sparse, and colbert
/// output heads.
///
/// Besides the live candle modules, the loaded tensor map is kept around by
/// name so the export tracer can read parameter values without reaching into
/// candle's (private) module internals.
pub struct M3Model {
    bert: BertModel,
    sparse_linear: Option<Linear>,
    colbert_linear: Option<Linear>,
    dropout: Dropout,
    weights: HashMap<String, Tensor>,
    config: EncoderConfig,
    training: bool,
}

impl M3Model {
    /// Build a model from a `config.json` string and a named tensor map.
    ///
    /// Tensor names follow the standard BERT checkpoint layout
    /// (`embeddings.word_embeddings.weight`, `encoder.layer.0...`). The sparse
    /// and colbert heads are optional: checkpoints that were only fine-tuned
    /// for dense retrieval simply don't carry them.
    pub fn from_tensors(
        config_json: &str,
        tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        let bert_config: Config =
            serde_json::from_str(config_json).context("Failed to parse config.json")?;
        let config = EncoderConfig::from_json(config_json)?;

        // Tensors are Arc'd, so keeping the map alongside the modules is a
        // refcount bump, not a copy of the weight data.
        let vb = VarBuilder::from_tensors(tensors.clone(), DType::F32, device);
        let bert = BertModel::load(vb, &bert_config).context("Failed to load BERT weights")?;

        let sparse_linear = Self::load_head(&tensors, SPARSE_HEAD);
        let colbert_linear = Self::load_head(&tensors, COLBERT_HEAD);
        tracing::debug!(
            sparse = sparse_linear.is_some(),
            colbert = colbert_linear.is_some(),
            "Loaded model with {} tensors",
            tensors.len()
        );

        let dropout = Dropout::new(config.hidden_dropout_prob as f32);
        Ok(Self {
            bert,
            sparse_linear,
            colbert_linear,
            dropout,
            weights: tensors,
            config,
            training: false,
        })
    }

    fn load_head(tensors: &HashMap<String, Tensor>, name: &str) -> Option<Linear> {
        let weight = tensors.get(&format!("{name}.weight"))?.clone();
        let bias = tensors.get(&format!("{name}.bias")).cloned();
        Some(Linear::new(weight, bias))
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// All checkpoint tensors by name.
    pub fn weights(&self) -> &HashMap<String, Tensor> {
        &self.weights
    }

    /// Look up one checkpoint tensor by name.
    pub fn weight(&self, name: &str) -> Result<&Tensor> {
        self.weights
            .get(name)
            .with_context(|| format!("Checkpoint has no tensor named '{name}'"))
    }

    /// Toggle training-time behavior (dropout on the encoder output).
    ///
    /// Export always runs with this off; see `DenseWrapper`.
    pub fn set_train(&mut self, training: bool) {
        self.training = training;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Forward pass computing the requested heads.
    pub fn forward_with(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        heads: HeadSelection,
    ) -> Result<EmbeddingOutput> {
        ensure!(
            input_ids.dims().len() == 2,
            "input_ids must be (batch, seq_len), got {:?}",
            input_ids.dims()
        );
        ensure!(
            input_ids.dims() == attention_mask.dims(),
            "input_ids {:?} and attention_mask {:?} must have the same shape",
            input_ids.dims(),
            attention_mask.dims()
        );

        // Single-sequence input: all tokens share token type 0.
        let token_type_ids = input_ids.zeros_like()?;
        let hidden = self
            .bert
            .forward(input_ids, &token_type_ids, Some(attention_mask))
            .context("Encoder forward pass failed")?;
        let hidden = if self.training {
            self.dropout.forward(&hidden, true)?
        } else {
            hidden
        };

        let dense = if heads.dense {
            Some(self.dense_head(&hidden)?)
        } else {
            None
        };
        let sparse = if heads.sparse {
            Some(self.sparse_head(&hidden)?)
        } else {
            None
        };
        let colbert = if heads.colbert {
            Some(self.colbert_head(&hidden)?)
        } else {
            None
        };

        Ok(EmbeddingOutput {
            dense,
            sparse,
            colbert,
        })
    }

    /// Dense embedding: the `[CLS]` hidden state, L2-normalized so downstream
    /// consumers can use raw dot products for similarity.
    fn dense_head(&self, hidden: &Tensor) -> Result<Tensor> {
        let cls = hidden.narrow(1, 0, 1)?.squeeze(1)?;
        normalize(&cls)
    }

    /// Sparse lexical weights: one non-negative scalar per token.
    fn sparse_head(&self, hidden: &Tensor) -> Result<Tensor> {
        let Some(linear) = &self.sparse_linear else {
            bail!("Checkpoint does not provide a {SPARSE_HEAD} head");
        };
        linear.forward(hidden)?.relu()?.squeeze(2).map_err(Into::into)
    }

    /// Colbert-style per-token vectors, normalized per token.
    fn colbert_head(&self, hidden: &Tensor) -> Result<Tensor> {
        let Some(linear) = &self.colbert_linear else {
            bail!("Checkpoint does not provide a {COLBERT_HEAD} head");
        };
        normalize(&linear.forward(hidden)?)
    }
}

/// Normalize to unit length (L2) along the last dimension.
fn normalize(embeddings: &Tensor) -> Result<Tensor> {
    let norm = embeddings.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    embeddings
        .broadcast_div(&norm)
        .context("Normalization failed")
}

impl Loadable for M3Model {
    /// Load from a directory containing `config.json` and `model.safetensors`.
    fn load(source: &Path, device: &Device) -> Result<Self> {
        let config_path = source.join("config.json");
        let weights_path = source.join("model.safetensors");

        let config_json = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let tensors = candle_core::safetensors::load(&weights_path, device)
            .with_context(|| format!("Failed to read {}", weights_path.display()))?;

        tracing::info!("Loading model from {}", source.display());
        Self::from_tensors(&config_json, tensors, device)
    }
}

impl Invokable for M3Model {
    type Output = EmbeddingOutput;

    fn invoke(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<EmbeddingOutput> {
        self.forward_with(input_ids, attention_mask, HeadSelection::all())
    }
}
