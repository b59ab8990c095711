use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The slice of `config.json` the export pipeline needs to know about.
///
/// Candle's own `bert::Config` keeps its fields private, so the same JSON is
/// parsed a second time into this struct for the dimensions the graph tracer
/// has to lay out explicitly.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_hidden_dropout_prob")]
    pub hidden_dropout_prob: f64,
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_hidden_dropout_prob() -> f64 {
    0.1
}

impl EncoderConfig {
    pub fn from_json(config_json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(config_json).context("Failed to parse config.json")?;
        ensure!(
            config.hidden_size % config.num_attention_heads == 0,
            "hidden_size {} is not divisible by num_attention_heads {}",
            config.hidden_size,
            config.num_attention_heads
        );
        Ok(config)
    }

    /// Width of a single attention head.
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}
