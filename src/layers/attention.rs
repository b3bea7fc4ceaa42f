//! Multi-Head Causal Self-Attention
//!
//! OPT attention with separate query, key and value projections:
//!
//! 1. **Projections**: `q = q_proj(x) * head_dim^-0.5`, `k = k_proj(x)`, `v = v_proj(x)`
//! 2. **Split heads**: `[batch, seq, hidden]` → `[batch, heads, seq, head_dim]`
//! 3. **Scores**: `q @ k^T`
//! 4. **Causal mask**: future positions set to -inf
//! 5. **Softmax** over the key axis
//! 6. **Weighted sum**: `attn @ v`
//! 7. **Merge heads** back to `[batch, seq, hidden]` and apply `out_proj`
//!
//! The merged tensor from step 7 is the *input* of `out_proj`; it is what the
//! attention sparsity hook inspects, one `head_dim` slice per head.

use crate::error::Result;
use crate::hooks::{emit, ForwardObserver, ModuleOutput};
use crate::tensor::Tensor;
use crate::weights::WeightSource;
use rand::Rng;

use super::linear::Linear;

/// Self-attention block (`*.self_attn`)
pub struct Attention {
    pub name: String,
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
    /// Number of attention heads
    pub n_heads: usize,
    /// Dimension per head (hidden / n_heads)
    pub head_dim: usize,
}

impl Attention {
    pub fn random<R: Rng + ?Sized>(
        name: impl Into<String>,
        hidden: usize,
        n_heads: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let name = name.into();
        Self {
            q_proj: Linear::random(format!("{name}.q_proj"), hidden, hidden, bias, rng),
            k_proj: Linear::random(format!("{name}.k_proj"), hidden, hidden, bias, rng),
            v_proj: Linear::random(format!("{name}.v_proj"), hidden, hidden, bias, rng),
            out_proj: Linear::random(format!("{name}.out_proj"), hidden, hidden, bias, rng),
            n_heads,
            head_dim: hidden / n_heads,
            name,
        }
    }

    pub fn load(
        source: &dyn WeightSource,
        name: impl Into<String>,
        hidden: usize,
        n_heads: usize,
        bias: bool,
    ) -> Result<Self> {
        let name = name.into();
        Ok(Self {
            q_proj: Linear::load(source, format!("{name}.q_proj"), bias)?,
            k_proj: Linear::load(source, format!("{name}.k_proj"), bias)?,
            v_proj: Linear::load(source, format!("{name}.v_proj"), bias)?,
            out_proj: Linear::load(source, format!("{name}.out_proj"), bias)?,
            n_heads,
            head_dim: hidden / n_heads,
            name,
        })
    }

    /// Submodule names in execution order
    pub fn module_names(&self) -> Vec<String> {
        vec![
            self.q_proj.name.clone(),
            self.k_proj.name.clone(),
            self.v_proj.name.clone(),
            self.out_proj.name.clone(),
            self.name.clone(),
        ]
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [batch, seq_len, hidden]
    ///
    /// # Returns
    ///
    /// Output tensor [batch, seq_len, hidden]
    pub fn forward(&self, x: &Tensor, observer: &mut dyn ForwardObserver) -> Result<Tensor> {
        let batch_size = x.shape[0];
        let seq_len = x.shape[1];

        let scaling = (self.head_dim as f32).powf(-0.5);
        let q = self.q_proj.forward(x, observer)?.mul_scalar(scaling);
        let k = self.k_proj.forward(x, observer)?;
        let v = self.v_proj.forward(x, observer)?;

        let q = self.split_heads(&q, batch_size, seq_len);
        let k = self.split_heads(&k, batch_size, seq_len);
        let v = self.split_heads(&v, batch_size, seq_len);

        // [batch, heads, seq, head_dim] @ [batch, heads, head_dim, seq]
        let scores = q.matmul(&k.transpose(2, 3));
        let scores = scores.masked_fill(&causal_mask(seq_len), f32::NEG_INFINITY);
        let attn = scores.softmax_last();

        // [batch, heads, seq, seq] @ [batch, heads, seq, head_dim]
        let out = attn.matmul(&v);
        let merged = self.merge_heads(&out, batch_size, seq_len);

        let y = self.out_proj.forward(&merged, observer)?;
        emit(observer, &self.name, &[x], ModuleOutput::Tuple(vec![&y]))?;
        Ok(y)
    }

    /// [batch, seq, hidden] -> [batch, n_heads, seq, head_dim]
    fn split_heads(&self, x: &Tensor, batch_size: usize, seq_len: usize) -> Tensor {
        x.reshape(&[batch_size, seq_len, self.n_heads, self.head_dim])
            .transpose(1, 2)
    }

    /// [batch, n_heads, seq, head_dim] -> [batch, seq, hidden]
    fn merge_heads(&self, x: &Tensor, batch_size: usize, seq_len: usize) -> Tensor {
        x.transpose(1, 2)
            .reshape(&[batch_size, seq_len, self.n_heads * self.head_dim])
    }
}

/// Causal mask: 1 where key position `j` is after query position `i`
///
/// For seq_len=3:
/// ```text
/// [0 1 1]
/// [0 0 1]
/// [0 0 0]
/// ```
pub fn causal_mask(seq_len: usize) -> Tensor {
    let mut mask = vec![0.0; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask[i * seq_len + j] = 1.0;
        }
    }
    Tensor::new(mask, vec![seq_len, seq_len])
}
