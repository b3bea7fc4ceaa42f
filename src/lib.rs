//! OPT Sparsity: activation and attention sparsity of OPT language models
//!
//! A forward-only OPT decoder in plain Rust whose every submodule reports to
//! a hook observer by its Hugging Face name. Collectors attached to those
//! hooks count how many fc activations and attention head outputs exceed a
//! magnitude threshold, across one prompt or a whole dataset split.
//!
//! # Modules
//!
//! - [`tensor`] - Minimal CPU tensor with the kernels the decoder needs
//! - [`layers`] - Linear, layer norm, embeddings, attention, decoder layer
//! - [`model`] - The OPT decoder
//! - [`hooks`] - Module call observers and hook tables
//! - [`collector`] - Record-only and sparsity collectors
//! - [`weights`], [`hub`], [`tokenizer`] - Checkpoint and tokenizer loading
//! - [`dataset`], [`runtime`], [`logger`], [`plot`] - Running and reporting
//!
//! # Example
//!
//! ```rust,no_run
//! use opt_sparsity::{runtime, CollectorConfig, OptCollector};
//!
//! let mut collector = runtime::run_module(
//!     "facebook/opt-125m",
//!     OptCollector::new(CollectorConfig::default()),
//!     runtime::DEFAULT_PROMPT,
//! )?;
//! runtime::print_report(&mut collector)?;
//! # Ok::<(), opt_sparsity::Error>(())
//! ```

pub mod collector;
pub mod config;
pub mod dataset;
pub mod error;
pub mod hooks;
pub mod hub;
pub mod layers;
pub mod logger;
pub mod model;
pub mod plot;
pub mod runtime;
pub mod tensor;
pub mod tokenizer;
pub mod weights;

// Re-export main types for convenience
pub use collector::{
    Collector, CollectorState, ModuleCollector, ModuleRecord, OptCollector, SparsityCounter,
    SparsityReport, TensorDataInfo,
};
pub use config::{CollectorConfig, OptConfig};
pub use dataset::{DatasetSpec, SequenceLoader};
pub use error::{Error, Result};
pub use hooks::{ForwardObserver, Hook, HookTable, ModuleCall, ModuleOutput, NoHooks};
pub use hub::{ModelFiles, TokenizerFiles};
pub use logger::SparsityLogger;
pub use model::OptModel;
pub use plot::Plotter;
pub use tensor::Tensor;
pub use tokenizer::OptTokenizer;
pub use weights::{MapSource, SafeTensorStore, WeightSource};
