//! Evaluation Data Loading
//!
//! Streams a raw-text dataset split through the model as fixed-length
//! token windows.
//!
//! ## Locating the split
//!
//! A [`DatasetSpec`] names a dataset the way the Hugging Face hub does
//! (`wikitext` / `wikitext-2-raw-v1` / `test`). It resolves to a raw text
//! file under a local data directory, trying in order:
//!
//! ```text
//! <dir>/<path>/<name>/<split>.txt
//! <dir>/<path>/<name>/wiki.<split>.raw
//! ```
//!
//! The second form is the layout of the unpacked wikitext archives.
//!
//! ## How windows are generated
//!
//! The whole split is tokenized once; windows are cut without overlap:
//!
//! ```text
//! Tokens: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
//! Seq length: 4
//! Batch size: 2
//!
//! Batch 1: [1, 2, 3, 4]  [5, 6, 7, 8]
//! Batch 2: [9, 10]
//! ```
//!
//! A trailing partial window is emitted alone in its own batch, so every
//! batch stays rectangular and no token is skipped.

use crate::error::{Error, Result};
use crate::tokenizer::OptTokenizer;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Batch of token windows, shape [batch_size][seq_len]
pub type Batch = Vec<Vec<usize>>;

/// Dataset identifier: `(path, name, split)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    pub path: String,
    pub name: String,
    pub split: String,
}

impl Default for DatasetSpec {
    fn default() -> Self {
        Self {
            path: "wikitext".to_string(),
            name: "wikitext-2-raw-v1".to_string(),
            split: "test".to_string(),
        }
    }
}

impl DatasetSpec {
    pub fn new(path: impl Into<String>, name: impl Into<String>, split: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            split: split.into(),
        }
    }

    /// Candidate files for this split under `data_dir`, in lookup order
    pub fn candidates(&self, data_dir: &Path) -> Vec<PathBuf> {
        let base = data_dir.join(&self.path).join(&self.name);
        vec![
            base.join(format!("{}.txt", self.split)),
            base.join(format!("wiki.{}.raw", self.split)),
        ]
    }

    /// First existing candidate file
    pub fn resolve(&self, data_dir: &Path) -> Result<PathBuf> {
        let candidates = self.candidates(data_dir);
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or_else(|| {
                Error::Dataset(format!(
                    "{}/{}/{} not found; looked for {}",
                    self.path,
                    self.name,
                    self.split,
                    candidates
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    /// Read the whole split as text
    pub fn read(&self, data_dir: &Path) -> Result<String> {
        let path = self.resolve(data_dir)?;
        info!(dataset = %self, path = %path.display(), "reading dataset split");
        Ok(fs::read_to_string(path)?)
    }
}

impl std::fmt::Display for DatasetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.path, self.name, self.split)
    }
}

/// Fixed-length window iterator over a token stream
///
/// # Fields
///
/// - `tokens`: All tokenized data
/// - `seq_len`: Length of each window
/// - `batch_size`: Maximum windows per batch
/// - `max_batches`: Optional cap on the number of batches yielded
/// - `position`: Start of the next window
pub struct SequenceLoader {
    tokens: Vec<usize>,
    seq_len: usize,
    batch_size: usize,
    max_batches: Option<usize>,
    position: usize,
    yielded: usize,
}

impl SequenceLoader {
    /// Create a loader over already tokenized data
    pub fn new(tokens: Vec<usize>, seq_len: usize, batch_size: usize) -> Result<Self> {
        if seq_len == 0 || batch_size == 0 {
            return Err(Error::config("seq_len and batch_size must be positive"));
        }
        Ok(Self {
            tokens,
            seq_len,
            batch_size,
            max_batches: None,
            position: 0,
            yielded: 0,
        })
    }

    /// Tokenize `text` once and create a loader over it
    pub fn from_text(
        text: &str,
        tokenizer: &OptTokenizer,
        seq_len: usize,
        batch_size: usize,
    ) -> Result<Self> {
        let tokens = tokenizer.encode(text)?;
        info!(tokens = tokens.len(), seq_len, batch_size, "tokenized dataset");
        Self::new(tokens, seq_len, batch_size)
    }

    /// Stop after `max_batches` batches
    pub fn with_max_batches(mut self, max_batches: Option<usize>) -> Self {
        self.max_batches = max_batches;
        self
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }

    /// Total number of batches in one pass, honoring the batch cap
    pub fn num_batches(&self) -> usize {
        let full_windows = self.tokens.len() / self.seq_len;
        let partial = usize::from(self.tokens.len() % self.seq_len != 0);
        let batches = full_windows.div_ceil(self.batch_size) + partial;
        self.max_batches.map_or(batches, |cap| batches.min(cap))
    }

    /// Rewind to the first window
    pub fn reset(&mut self) {
        self.position = 0;
        self.yielded = 0;
    }

    /// Next batch of windows, or `None` once the data is exhausted
    pub fn next_batch(&mut self) -> Option<Batch> {
        if self.max_batches.is_some_and(|cap| self.yielded >= cap) {
            return None;
        }
        let remaining = self.tokens.len() - self.position;
        if remaining == 0 {
            return None;
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        if remaining < self.seq_len {
            // Trailing partial window
            batch.push(self.tokens[self.position..].to_vec());
            self.position = self.tokens.len();
        } else {
            while batch.len() < self.batch_size && self.position + self.seq_len <= self.tokens.len() {
                batch.push(self.tokens[self.position..self.position + self.seq_len].to_vec());
                self.position += self.seq_len;
            }
        }

        self.yielded += 1;
        Some(batch)
    }
}

impl Iterator for SequenceLoader {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        self.next_batch()
    }
}
