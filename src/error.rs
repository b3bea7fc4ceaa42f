//! Error types for sparsity collection.
//!
//! Every failure is fatal to a run: there are no retries. Errors propagate
//! with `?` up to the binary, which logs them and exits non-zero.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while loading a model, running it, or collecting statistics.
#[derive(Debug, Error)]
pub enum Error {
    /// A hook requiring the attention head count fired before `register_hook`.
    #[error("attention head count is not configured; call register_hook before {operation}")]
    Unconfigured { operation: &'static str },

    /// A hook that expects a single tensor received something else.
    #[error("hook `{name}` expected a tensor output, got {found}")]
    NotATensor { name: String, found: &'static str },

    /// The last dimension cannot be split evenly across attention heads.
    #[error("cannot split shape {shape:?} into {n_head} heads")]
    HeadSplit { shape: Vec<usize>, n_head: usize },

    /// A tensor had an unexpected shape.
    #[error("shape error: {0}")]
    Shape(String),

    /// A ratio was requested from a counter that never saw an element.
    #[error("{0} sparsity counter is empty; no hooked module ran")]
    EmptyCounter(&'static str),

    /// A parameter is absent from the checkpoint.
    #[error("missing weight `{0}`")]
    MissingWeight(String),

    /// A checkpoint tensor uses a dtype we cannot convert to f32.
    #[error("unsupported dtype {dtype} for tensor `{name}`")]
    UnsupportedDtype { name: String, dtype: String },

    /// Invalid model or collector configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Tokenizer construction or encoding failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Downloading from the Hugging Face Hub failed.
    #[error("hub error: {0}")]
    Hub(String),

    /// The requested dataset split could not be located or read.
    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl Error {
    /// Create a shape error.
    pub fn shape(message: impl Into<String>) -> Self {
        Error::Shape(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }
}
