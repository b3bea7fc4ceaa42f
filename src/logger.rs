//! Dataset Progress Logger
//!
//! Tracks the running sparsity counters while a dataset is streamed through
//! the model, one CSV row per batch.
//!
//! ## CSV Format
//!
//! - `step`: Batch number, starting at 1
//! - `elapsed_seconds`: Time since the logger was created
//! - `tokens`: Tokens processed so far
//! - `fc_above`, `fc_total`, `fc_ratio`: Running fc activation counts
//! - `attn_above`, `attn_total`, `attn_ratio`: Running attention counts
//!
//! Ratios are left empty while a counter has seen no elements.
//!
//! ## Example
//!
//! ```rust,no_run
//! use opt_sparsity::{SparsityCounter, SparsityLogger};
//!
//! let mut logger = SparsityLogger::new("sparsity_log.csv")?;
//! let fc = SparsityCounter { above: 40, total: 1000 };
//! let attn = SparsityCounter { above: 700, total: 1000 };
//! logger.log(1, 2048, &fc, &attn)?;
//! # Ok::<(), opt_sparsity::Error>(())
//! ```

use crate::collector::SparsityCounter;
use crate::error::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// CSV progress logger for dataset runs
///
/// # Fields
///
/// - `log_file`: Output CSV file
/// - `start_time`: When the run started (for elapsed time calculation)
/// - `last_log_time`: Last log timestamp (for per-batch timing)
pub struct SparsityLogger {
    log_file: BufWriter<File>,
    start_time: Instant,
    last_log_time: Instant,
}

impl SparsityLogger {
    /// Create the CSV file and write its header
    pub fn new(log_path: impl AsRef<Path>) -> Result<Self> {
        let mut log_file = BufWriter::new(File::create(log_path.as_ref())?);

        writeln!(
            log_file,
            "step,elapsed_seconds,tokens,fc_above,fc_total,fc_ratio,attn_above,attn_total,attn_ratio"
        )?;
        log_file.flush()?;

        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Log the running counters after one batch
    pub fn log(
        &mut self,
        step: usize,
        tokens: usize,
        fc: &SparsityCounter,
        attn: &SparsityCounter,
    ) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();

        writeln!(
            self.log_file,
            "{},{:.2},{},{},{},{},{},{},{}",
            step,
            elapsed,
            tokens,
            fc.above,
            fc.total,
            ratio_cell(fc),
            attn.above,
            attn.total,
            ratio_cell(attn)
        )?;

        // Flush so a crash mid-run keeps every completed batch
        self.log_file.flush()?;

        let step_time = self.last_log_time.elapsed().as_secs_f32();
        info!(
            step,
            tokens,
            elapsed = %format!("{elapsed:.1}s"),
            step_time = %format!("{step_time:.1}s"),
            fc = %fc,
            attn = %attn,
            "batch done"
        );

        self.last_log_time = Instant::now();
        Ok(())
    }
}

fn ratio_cell(counter: &SparsityCounter) -> String {
    counter
        .ratio()
        .map(|r| format!("{r:.6}"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_rows_are_flushed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut logger = SparsityLogger::new(&path).unwrap();

        let fc = SparsityCounter { above: 1, total: 4 };
        logger.log(1, 16, &fc, &SparsityCounter::new()).unwrap();

        let csv = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("step,elapsed_seconds,tokens"));

        let cells: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(cells[0], "1");
        assert_eq!(cells[2], "16");
        assert_eq!(&cells[3..6], &["1", "4", "0.250000"]);
        assert_eq!(&cells[6..9], &["0", "0", ""]);
    }
}
