//! Sparsity counters and the final report

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Running `[above, total]` element counts
///
/// Both fields only grow, and `above <= total` always holds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparsityCounter {
    pub above: u64,
    pub total: u64,
}

impl SparsityCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one tensor's counts
    pub fn add(&mut self, above: u64, total: u64) {
        debug_assert!(above <= total, "above {above} exceeds total {total}");
        self.above += above;
        self.total += total;
    }

    /// Fraction of counted elements above the threshold
    pub fn ratio(&self) -> Option<f64> {
        (self.total > 0).then(|| self.above as f64 / self.total as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl fmt::Display for SparsityCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.above, self.total)
    }
}

/// Final fc and attention counters of a run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SparsityReport {
    pub fc: SparsityCounter,
    pub attn: SparsityCounter,
}

impl SparsityReport {
    /// The two result lines, e.g. `overall fc sparsity is 0.04 == [12, 300]`
    pub fn lines(&self) -> Result<[String; 2]> {
        Ok([
            line("fc", &self.fc)?,
            line("attn", &self.attn)?,
        ])
    }
}

fn line(kind: &'static str, counter: &SparsityCounter) -> Result<String> {
    let ratio = counter.ratio().ok_or(Error::EmptyCounter(kind))?;
    Ok(format!("overall {kind} sparsity is {ratio:.2} == {counter}"))
}
