//! Model and collector configuration
//!
//! [`OptConfig`] mirrors the Hugging Face `config.json` of an OPT checkpoint,
//! with the same defaults the reference configuration class uses for absent
//! keys. [`CollectorConfig`] holds the sparsity thresholds and plot output
//! settings; it can be loaded from a JSON file and overridden from the CLI.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// OPT model configuration
///
/// # Fields
///
/// - `hidden_size`: width of the residual stream
/// - `ffn_dim`: hidden width of each feedforward block (`fc1` output)
/// - `num_attention_heads`: heads per self-attention layer
/// - `word_embed_proj_dim`: embedding width; differs from `hidden_size` only
///   for checkpoints with `project_in`/`project_out` (e.g. opt-350m)
/// - `do_layer_norm_before`: pre-norm (true) or post-norm (false) layers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub ffn_dim: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    pub do_layer_norm_before: bool,
    #[serde(rename = "_remove_final_layer_norm")]
    pub remove_final_layer_norm: bool,
    pub word_embed_proj_dim: Option<usize>,
    pub activation_function: String,
    pub enable_bias: bool,
    pub layer_norm_elementwise_affine: bool,
    pub pad_token_id: usize,
    pub bos_token_id: usize,
    pub eos_token_id: usize,
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            vocab_size: 50272,
            hidden_size: 768,
            num_hidden_layers: 12,
            ffn_dim: 3072,
            num_attention_heads: 12,
            max_position_embeddings: 2048,
            do_layer_norm_before: true,
            remove_final_layer_norm: false,
            word_embed_proj_dim: None,
            activation_function: "relu".to_string(),
            enable_bias: true,
            layer_norm_elementwise_affine: true,
            pad_token_id: 1,
            bos_token_id: 2,
            eos_token_id: 2,
        }
    }
}

impl OptConfig {
    /// A tiny configuration for tests and dry runs
    ///
    /// Two layers, four heads, 32-wide residual stream.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            hidden_size: 32,
            num_hidden_layers: 2,
            ffn_dim: 128,
            num_attention_heads: 4,
            max_position_embeddings: 64,
            ..Self::default()
        }
    }

    /// Load a Hugging Face `config.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the forward pass relies on
    pub fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 {
            return Err(Error::config("num_attention_heads must be positive"));
        }
        if self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }

    /// Embedding width (falls back to `hidden_size`)
    pub fn embed_dim(&self) -> usize {
        self.word_embed_proj_dim.unwrap_or(self.hidden_size)
    }

    /// Dimension of each attention head
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    /// Whether the decoder applies a final layer norm
    pub fn has_final_layer_norm(&self) -> bool {
        self.do_layer_norm_before && !self.remove_final_layer_norm
    }
}

/// Collector thresholds and plot output settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Magnitude above which an fc activation counts as active
    pub fc_sparsity_threshold: f32,
    /// Magnitude above which an attention output element counts as active
    pub attn_sparsity_threshold: f32,
    /// Directory for diagnostic plots
    pub output_dir: PathBuf,
    /// Write plots at all
    pub plots: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            fc_sparsity_threshold: 0.001,
            attn_sparsity_threshold: 0.1,
            output_dir: PathBuf::from("output/opt"),
            plots: true,
        }
    }
}

impl CollectorConfig {
    /// Load collector settings from a JSON file; absent keys keep defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&json)?;
        if config.fc_sparsity_threshold < 0.0 || config.attn_sparsity_threshold < 0.0 {
            return Err(Error::config("sparsity thresholds must be non-negative"));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hf_config_defaults_fill_missing_keys() {
        let json = r#"{
            "hidden_size": 5120,
            "num_hidden_layers": 40,
            "ffn_dim": 20480,
            "num_attention_heads": 40,
            "_remove_final_layer_norm": false,
            "torch_dtype": "float16"
        }"#;
        let config: OptConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_attention_heads, 40);
        assert_eq!(config.head_dim(), 128);
        assert_eq!(config.vocab_size, 50272);
        assert_eq!(config.activation_function, "relu");
        assert_eq!(config.embed_dim(), 5120);
        assert!(config.has_final_layer_norm());
    }

    #[test]
    fn test_validate_rejects_indivisible_heads() {
        let config = OptConfig {
            hidden_size: 30,
            num_attention_heads: 4,
            ..OptConfig::tiny(16)
        };
        assert!(config.validate().is_err());
        assert!(OptConfig::tiny(16).validate().is_ok());
    }

    #[test]
    fn test_collector_defaults() {
        let config: CollectorConfig = serde_json::from_str(r#"{"plots": false}"#).unwrap();
        assert_eq!(config.fc_sparsity_threshold, 0.001);
        assert_eq!(config.attn_sparsity_threshold, 0.1);
        assert_eq!(config.output_dir, PathBuf::from("output/opt"));
        assert!(!config.plots);
    }
}
