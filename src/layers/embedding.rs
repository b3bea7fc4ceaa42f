//! Token and Position Embeddings
//!
//! ```text
//! Input:  [batch, seq_len]          (token IDs)
//! Output: [batch, seq_len, dim]     (embedding vectors)
//! ```
//!
//! OPT's learned positional embedding reserves the first two rows of its
//! table, so position `p` reads row `p + 2`. The table therefore has
//! `max_position_embeddings + 2` rows.

use crate::error::{Error, Result};
use crate::hooks::{emit, ForwardObserver, ModuleOutput};
use crate::tensor::Tensor;
use crate::weights::WeightSource;
use rand::Rng;

use super::linear::normal_tensor;

/// Row offset of OPT's learned positional embedding
pub const POSITION_OFFSET: usize = 2;

/// Lookup table from ids to vectors
pub struct Embedding {
    pub name: String,
    /// Embedding weight matrix: [num_embeddings, dim]
    pub weight: Tensor,
}

impl Embedding {
    pub fn random<R: Rng + ?Sized>(
        name: impl Into<String>,
        num_embeddings: usize,
        dim: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            name: name.into(),
            weight: normal_tensor(rng, vec![num_embeddings, dim], 0.02),
        }
    }

    pub fn load(source: &dyn WeightSource, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let weight = source.tensor(&format!("{name}.weight"))?;
        if weight.shape.len() != 2 {
            return Err(Error::shape(format!(
                "embedding `{name}` must be 2D, got {:?}",
                weight.shape
            )));
        }
        Ok(Self { name, weight })
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn dim(&self) -> usize {
        self.weight.shape[1]
    }

    /// Gather rows for every id; ids are checked against the table size
    fn gather(&self, ids: &[Vec<usize>]) -> Result<Tensor> {
        let batch_size = ids.len();
        let seq_len = ids.first().map_or(0, Vec::len);
        let dim = self.dim();

        let mut output = Vec::with_capacity(batch_size * seq_len * dim);
        for row in ids {
            if row.len() != seq_len {
                return Err(Error::shape(format!(
                    "ragged batch: sequence lengths {} and {}",
                    seq_len,
                    row.len()
                )));
            }
            for &id in row {
                if id >= self.num_embeddings() {
                    return Err(Error::shape(format!(
                        "id {} out of range for `{}` ({} rows)",
                        id,
                        self.name,
                        self.num_embeddings()
                    )));
                }
                output.extend_from_slice(&self.weight.data[id * dim..(id + 1) * dim]);
            }
        }

        Ok(Tensor::new(output, vec![batch_size, seq_len, dim]))
    }

    /// Token embedding lookup
    pub fn forward(
        &self,
        token_ids: &[Vec<usize>],
        observer: &mut dyn ForwardObserver,
    ) -> Result<Tensor> {
        let y = self.gather(token_ids)?;
        emit(observer, &self.name, &[], ModuleOutput::Tensor(&y))?;
        Ok(y)
    }

    /// Learned positional embedding for positions `0..seq_len`
    ///
    /// Returns `[batch, seq_len, dim]`; every batch row reads the same
    /// positions since batches carry no padding.
    pub fn forward_positions(
        &self,
        batch_size: usize,
        seq_len: usize,
        observer: &mut dyn ForwardObserver,
    ) -> Result<Tensor> {
        let positions: Vec<usize> = (0..seq_len).map(|p| p + POSITION_OFFSET).collect();
        let ids = vec![positions; batch_size];
        let y = self.gather(&ids)?;
        emit(observer, &self.name, &[], ModuleOutput::Tensor(&y))?;
        Ok(y)
    }
}
