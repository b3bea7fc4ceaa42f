//! OPT sparsity measurement
//!
//! Hooks every `activation_fn` and `self_attn.out_proj` of an OPT model and
//! reports how many activations exceed the fc and attention thresholds.
//!
//! ## Usage
//!
//! ```bash
//! # One forward pass on a prompt
//! opt-sparsity example --model facebook/opt-125m
//!
//! # Every window of the wikitext-2 test split
//! opt-sparsity dataset --model facebook/opt-125m --data-dir data --seq-len 512 --log-csv sparsity.csv
//! ```
//!
//! Logging is controlled with `RUST_LOG` (default `info`).

use clap::{Args, Parser, Subcommand};
use opt_sparsity::runtime::{
    print_report, run_module, run_module_dataset, DataSource, DatasetOptions, DEFAULT_PROMPT,
};
use opt_sparsity::{CollectorConfig, DatasetSpec, OptCollector, Result};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_MODEL: &str = "facebook/opt-13b";

#[derive(Parser)]
#[command(
    name = "opt-sparsity",
    about = "Measure fc activation and attention head sparsity of OPT models"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single prompt through the model
    Example {
        /// Hub model id or local checkpoint directory
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,

        /// Prompt text
        #[arg(long, default_value = DEFAULT_PROMPT)]
        prompt: String,

        #[command(flatten)]
        collector: CollectorArgs,
    },
    /// Stream a dataset split through the model
    Dataset {
        /// Hub model id or local checkpoint directory
        #[arg(long, default_value = DEFAULT_MODEL)]
        model: String,

        /// Dataset path
        #[arg(long, default_value = "wikitext")]
        dataset: String,

        /// Dataset configuration name
        #[arg(long, default_value = "wikitext-2-raw-v1")]
        subset: String,

        /// Dataset split
        #[arg(long, default_value = "test")]
        split: String,

        /// Directory holding `<dataset>/<subset>/<split>` text files
        #[arg(long, default_value = "data", conflicts_with = "data_file")]
        data_dir: PathBuf,

        /// Read this raw text file instead of resolving the split
        #[arg(long)]
        data_file: Option<PathBuf>,

        /// Tokens per window
        #[arg(long, default_value = "2048")]
        seq_len: usize,

        /// Windows per forward pass
        #[arg(long, default_value = "1")]
        batch_size: usize,

        /// Stop after this many batches
        #[arg(long)]
        max_batches: Option<usize>,

        /// Write per-batch running counters to this CSV file
        #[arg(long)]
        log_csv: Option<PathBuf>,

        #[command(flatten)]
        collector: CollectorArgs,
    },
}

/// Collector settings shared by every command
#[derive(Args)]
struct CollectorArgs {
    /// Collector settings JSON; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Magnitude above which an fc activation counts as active
    #[arg(long)]
    fc_threshold: Option<f32>,

    /// Magnitude above which an attention output counts as active
    #[arg(long)]
    attn_threshold: Option<f32>,

    /// Directory for plots
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Skip writing plots
    #[arg(long)]
    no_plots: bool,
}

impl CollectorArgs {
    fn build(&self) -> Result<CollectorConfig> {
        let mut config = match &self.config {
            Some(path) => CollectorConfig::from_file(path)?,
            None => CollectorConfig::default(),
        };
        if let Some(threshold) = self.fc_threshold {
            config.fc_sparsity_threshold = threshold;
        }
        if let Some(threshold) = self.attn_threshold {
            config.attn_sparsity_threshold = threshold;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if self.no_plots {
            config.plots = false;
        }
        Ok(config)
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut collector = match cli.command {
        Command::Example {
            model,
            prompt,
            collector,
        } => {
            let config = collector.build()?;
            info!(model = %model, ?config, "collecting sparsity on example prompt");
            run_module(&model, OptCollector::new(config), &prompt)?
        }
        Command::Dataset {
            model,
            dataset,
            subset,
            split,
            data_dir,
            data_file,
            seq_len,
            batch_size,
            max_batches,
            log_csv,
            collector,
        } => {
            let config = collector.build()?;
            let spec = DatasetSpec::new(dataset, subset, split);
            let options = DatasetOptions {
                source: match data_file {
                    Some(file) => DataSource::File(file),
                    None => DataSource::Dir(data_dir),
                },
                seq_len,
                batch_size,
                max_batches,
                log_csv,
            };
            info!(model = %model, dataset = %spec, ?config, "collecting sparsity on dataset");
            run_module_dataset(&model, OptCollector::new(config), &spec, &options)?
        }
    };

    print_report(&mut collector)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
