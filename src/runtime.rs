//! Run drivers
//!
//! Glue between model loading, collectors and data:
//!
//! - [`run_module`]: load a model, hook it, run one prompt
//! - [`run_module_dataset`]: load a model, hook it, stream a dataset split
//! - [`run_example`] / [`run_batches`]: the same on an already built model
//! - [`print_report`]: print the final sparsity lines
//!
//! Every driver takes the collector by value (or `&mut`) and hands it back,
//! so callers can inspect whatever the collector gathered.

use crate::collector::Collector;
use crate::config::OptConfig;
use crate::dataset::{Batch, DatasetSpec, SequenceLoader};
use crate::error::Result;
use crate::hub::ModelFiles;
use crate::logger::SparsityLogger;
use crate::model::OptModel;
use crate::tokenizer::OptTokenizer;
use crate::weights::SafeTensorStore;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};

/// Prompt used when none is given
pub const DEFAULT_PROMPT: &str = "Hey, are you conscious? Can you talk to me?";

/// Where dataset text comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// Resolve the split under this data directory
    Dir(PathBuf),
    /// Read this file directly
    File(PathBuf),
}

/// Settings for a dataset run
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub source: DataSource,
    pub seq_len: usize,
    pub batch_size: usize,
    pub max_batches: Option<usize>,
    pub log_csv: Option<PathBuf>,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            source: DataSource::Dir(PathBuf::from("data")),
            seq_len: 2048,
            batch_size: 1,
            max_batches: None,
            log_csv: None,
        }
    }
}

/// Load config, weights and tokenizer for `model_id`
pub fn load_model(model_id: &str) -> Result<(OptModel, OptTokenizer)> {
    let files = ModelFiles::resolve(model_id)?;
    let config = OptConfig::from_file(&files.config)?;
    let store = SafeTensorStore::open(&files.weights)?;
    let model = OptModel::load(&config, &store)?;
    let tokenizer = OptTokenizer::from_files(&files.tokenizer, config.bos_token_id)?;
    Ok((model, tokenizer))
}

/// Load `model_id`, register `collector` and run one forward pass on `prompt`
pub fn run_module<C: Collector>(model_id: &str, mut collector: C, prompt: &str) -> Result<C> {
    let (model, tokenizer) = load_model(model_id)?;
    collector.register_hook(&model)?;
    run_example(&model, &tokenizer, &mut collector, prompt)?;
    Ok(collector)
}

/// Load `model_id`, register `collector` and stream every window of `dataset`
pub fn run_module_dataset<C: Collector>(
    model_id: &str,
    mut collector: C,
    dataset: &DatasetSpec,
    options: &DatasetOptions,
) -> Result<C> {
    let (model, tokenizer) = load_model(model_id)?;
    collector.register_hook(&model)?;

    let text = match &options.source {
        DataSource::Dir(dir) => dataset.read(dir)?,
        DataSource::File(path) => {
            info!(path = %path.display(), "reading dataset file");
            std::fs::read_to_string(path)?
        }
    };

    let max_positions = model.config.max_position_embeddings;
    let seq_len = if options.seq_len > max_positions {
        warn!(
            requested = options.seq_len,
            max_positions, "sequence length capped at the model's context size"
        );
        max_positions
    } else {
        options.seq_len
    };

    let loader = SequenceLoader::from_text(&text, &tokenizer, seq_len, options.batch_size)?
        .with_max_batches(options.max_batches);
    let mut logger = options
        .log_csv
        .as_ref()
        .map(|path| SparsityLogger::new(path))
        .transpose()?;

    run_batches(&model, &mut collector, loader, logger.as_mut())?;
    Ok(collector)
}

/// Run one forward pass on `prompt` through an already hooked model
pub fn run_example<C: Collector>(
    model: &OptModel,
    tokenizer: &OptTokenizer,
    collector: &mut C,
    prompt: &str,
) -> Result<()> {
    let mut ids = tokenizer.encode(prompt)?;
    ids.truncate(model.config.max_position_embeddings);
    info!(tokens = ids.len(), "running example prompt");
    model.forward(&[ids], collector)?;
    Ok(())
}

/// Run every batch through an already hooked model; returns tokens processed
pub fn run_batches<C, I>(
    model: &OptModel,
    collector: &mut C,
    batches: I,
    mut logger: Option<&mut SparsityLogger>,
) -> Result<usize>
where
    C: Collector,
    I: IntoIterator<Item = Batch>,
{
    let start = Instant::now();
    let mut tokens = 0;
    let mut steps = 0;

    for (step, batch) in batches.into_iter().enumerate() {
        model.forward(&batch, collector)?;
        tokens += batch.iter().map(Vec::len).sum::<usize>();
        steps = step + 1;

        if let (Some(logger), Some(summary)) = (logger.as_deref_mut(), collector.summary()) {
            logger.log(steps, tokens, &summary.fc, &summary.attn)?;
        }
    }

    info!(
        batches = steps,
        tokens,
        seconds = %format!("{:.1}", start.elapsed().as_secs_f32()),
        "dataset pass complete"
    );
    Ok(tokens)
}

/// Finish the run and print the fc and attention sparsity lines
pub fn print_report<C: Collector>(collector: &mut C) -> Result<()> {
    match collector.finish()? {
        Some(report) => {
            for line in report.lines()? {
                println!("{line}");
            }
        }
        None => info!("collector keeps no sparsity counters"),
    }
    Ok(())
}
