//! Tensor Operations for the OPT Forward Pass
//!
//! A minimal dense `f32` tensor with exactly the operations an OPT decoder
//! forward pass and the sparsity collectors need. Tensors store a flat
//! row-major buffer plus shape and stride information.
//!
//! ## Core Concepts
//!
//! - **Data**: Flat `Vec<f32>` storing all elements in row-major order
//! - **Shape**: Dimensions of the tensor (e.g., `[batch, seq, dim]`)
//! - **Strides**: Step sizes for each dimension to compute flat indices
//!
//! ## Example
//!
//! ```rust
//! use opt_sparsity::Tensor;
//!
//! let t = Tensor::new(vec![0.0, -2.0, 0.5, 0.0, 3.0, 0.0], vec![2, 3]);
//! assert_eq!(t.count_above(0.1), 3);
//!
//! // Nonzero count per feature column
//! let per_column = t.count_nonzero_by_axes(&[1]);
//! assert_eq!(per_column.data, vec![0.0, 2.0, 1.0]);
//! ```
//!
//! ## Performance
//!
//! Matrix multiplication, element-wise operations, softmax and the counting
//! reductions run in parallel via Rayon. Shape mismatches inside kernels are
//! programming errors and panic; reshapes that depend on runtime data go
//! through [`Tensor::try_reshape`], which returns an error instead.

use crate::error::{Error, Result};
use rayon::prelude::*;

/// A multi-dimensional array of `f32` values
///
/// For shape `[2, 3]`, data is stored as
/// `[row0_col0, row0_col1, row0_col2, row1_col0, row1_col1, row1_col2]`
/// and strides are `[3, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all tensor elements
    pub data: Vec<f32>,
    /// Shape of the tensor (dimensions)
    pub shape: Vec<usize>,
    /// Strides for each dimension (computed from shape)
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with given data and shape
    ///
    /// # Panics
    ///
    /// Panics if the product of shape dimensions doesn't equal data length
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );

        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Create a tensor filled with zeros
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with `value`
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Row-major strides: for shape `[d0, d1, d2]`, strides are `[d1*d2, d2, 1]`
    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Total number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of the last dimension (1 for scalars)
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    #[inline(always)]
    fn matmul_inner_simd(a_val: f32, b: &[f32], result: &mut [f32]) {
        // Plain loop so LLVM can auto-vectorize it
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// Matrix multiplication
    ///
    /// Supports:
    /// - 2D × 2D: `[m, k] @ [k, n] -> [m, n]`
    /// - 4D × 4D: batched matmul for attention,
    ///   `[batch, heads, s1, k] @ [batch, heads, k, s2] -> [batch, heads, s1, s2]`
    ///
    /// # Panics
    ///
    /// Panics if dimensions are incompatible or unsupported
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        // === 2D MATRIX MULTIPLICATION ===
        if self.shape.len() == 2 && other.shape.len() == 2 {
            assert_eq!(
                self.shape[1], other.shape[0],
                "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
                self.shape[0], self.shape[1], other.shape[0], other.shape[1]
            );

            let m = self.shape[0];
            let n = other.shape[1];
            let k = self.shape[1];

            if m * n * k >= 1_000 {
                return self.matmul_parallel_blocked(other, m, n, k);
            }

            let mut result = vec![0.0; m * n];
            for i in 0..m {
                for j in 0..n {
                    let mut sum = 0.0;
                    for l in 0..k {
                        sum += self.data[i * k + l] * other.data[l * n + j];
                    }
                    result[i * n + j] = sum;
                }
            }

            return Tensor::new(result, vec![m, n]);
        }

        // === 4D BATCHED MATRIX MULTIPLICATION (attention) ===
        if self.shape.len() == 4 && other.shape.len() == 4 {
            let batch = self.shape[0];
            let n_heads = self.shape[1];
            let seq1 = self.shape[2];
            let inner_dim = self.shape[3];
            let seq2 = other.shape[3];

            assert_eq!(
                &other.shape[..3],
                &[batch, n_heads, inner_dim],
                "Batched matmul shapes incompatible: {:?} @ {:?}",
                self.shape,
                other.shape
            );

            let mut result = vec![0.0; batch * n_heads * seq1 * seq2];

            // Each (batch, head) pair is an independent seq1×seq2 product
            result
                .par_chunks_mut(seq1 * seq2)
                .enumerate()
                .for_each(|(bh_idx, chunk)| {
                    let a_base = bh_idx * seq1 * inner_dim;
                    let b_base = bh_idx * inner_dim * seq2;
                    for i in 0..seq1 {
                        let row = &mut chunk[i * seq2..(i + 1) * seq2];
                        for l in 0..inner_dim {
                            let a_val = self.data[a_base + i * inner_dim + l];
                            let b_row = &other.data[b_base + l * seq2..b_base + (l + 1) * seq2];
                            Self::matmul_inner_simd(a_val, b_row, row);
                        }
                    }
                });

            return Tensor::new(result, vec![batch, n_heads, seq1, seq2]);
        }

        panic!(
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape, other.shape
        );
    }

    /// Parallel cache-blocked 2D matrix multiplication
    ///
    /// Processes 8×8 blocks and distributes row blocks across cores.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);

                    for k_start in (0..k).step_by(BLOCK_SIZE) {
                        let k_end = (k_start + BLOCK_SIZE).min(k);

                        for i in i_start..i_end {
                            let row_offset = (i - i_start) * n;
                            for k_idx in k_start..k_end {
                                let a_val = self.data[i * k + k_idx];
                                Self::matmul_inner_simd(
                                    a_val,
                                    &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                    &mut result_block[row_offset + j_start..row_offset + j_end],
                                );
                            }
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Multiply by a transposed matrix: `[m, k] @ [n, k]^T -> [m, n]`
    ///
    /// Checkpoint linear weights are stored `[out_features, in_features]`,
    /// so this avoids materializing a transpose of every weight matrix.
    /// Both operands are read row-wise, which keeps the inner dot product
    /// contiguous.
    ///
    /// # Panics
    ///
    /// Panics if either operand is not 2D or the inner dimensions differ
    pub fn matmul_t(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "matmul_t expects 2D operands, got {:?} and {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[1],
            "Inner dimensions incompatible: [{}, {}] @ [{}, {}]^T",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[0];

        let mut result = vec![0.0; m * n];
        result
            .par_chunks_mut(n.max(1))
            .enumerate()
            .for_each(|(i, out_row)| {
                let a_row = &self.data[i * k..(i + 1) * k];
                for (j, out) in out_row.iter_mut().enumerate() {
                    let b_row = &other.data[j * k..(j + 1) * k];
                    *out = a_row.iter().zip(b_row).map(|(a, b)| a * b).sum();
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Softmax along the last axis
    ///
    /// Uses the numerically stable form `exp(x - max) / sum(exp(x - max))`,
    /// computed per row in parallel. Rows that are entirely `-inf` produce
    /// zeros rather than NaN.
    pub fn softmax_last(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = self.data.clone();

        result.par_chunks_mut(cols.max(1)).for_each(|row| {
            let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            if max == f32::NEG_INFINITY {
                row.iter_mut().for_each(|v| *v = 0.0);
                return;
            }
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            for v in row.iter_mut() {
                *v /= sum;
            }
        });

        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition with broadcasting support
    ///
    /// 1. **Exact match**: Same shape
    /// 2. **Broadcast batch**: `[batch, seq, dim] + [seq, dim]`
    /// 3. **Broadcast last dim**: `[*, n] + [n]` (bias addition)
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() == 3 && other.shape.len() == 2 && self.shape[1..] == other.shape[..] {
            let plane = other.data.len();
            let result: Vec<f32> = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x + other.data[i % plane])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() > other.shape.len() && other.data.len() == self.last_dim() {
            let last_dim = self.last_dim();
            let result: Vec<f32> = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x + other.data[i % last_dim])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// Element-wise multiplication, exact shape or `[*, n] * [n]`
    pub fn mul(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a * b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        if self.shape.len() > other.shape.len() && other.data.len() == self.last_dim() {
            let last_dim = self.last_dim();
            let result: Vec<f32> = self
                .data
                .par_iter()
                .enumerate()
                .map(|(i, &x)| x * other.data[i % last_dim])
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "Unsupported broadcast for mul: {:?} * {:?}",
            self.shape, other.shape
        );
    }

    /// Multiply all elements by scalar
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        self.map(|x| x * scalar)
    }

    /// Element-wise absolute value
    pub fn abs(&self) -> Tensor {
        self.map(f32::abs)
    }

    /// Apply `f` to every element
    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32 + Sync + Send,
    {
        let result = self.data.par_iter().map(|&x| f(x)).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Reshape tensor to new shape
    ///
    /// # Panics
    ///
    /// Panics if the element count changes; see [`Tensor::try_reshape`]
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} to {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Reshape, returning an error when the element count does not match
    pub fn try_reshape(&self, new_shape: &[usize]) -> Result<Tensor> {
        let new_size: usize = new_shape.iter().product();
        if new_size != self.data.len() {
            return Err(Error::shape(format!(
                "cannot reshape {:?} ({} elements) to {:?}",
                self.shape,
                self.data.len(),
                new_shape
            )));
        }
        Ok(Tensor::new(self.data.clone(), new_shape.to_vec()))
    }

    /// Collapse all leading dimensions: `[a, b, .., n] -> [a*b*.., n]`
    pub fn flatten_to_2d(&self) -> Tensor {
        let cols = self.last_dim();
        let rows = if cols == 0 { 0 } else { self.numel() / cols };
        self.reshape(&[rows, cols])
    }

    /// Transpose two dimensions (negative indices count from the end)
    pub fn transpose(&self, dim1: isize, dim2: isize) -> Tensor {
        let ndim = self.shape.len() as isize;
        let d1 = if dim1 < 0 { ndim + dim1 } else { dim1 } as usize;
        let d2 = if dim2 < 0 { ndim + dim2 } else { dim2 } as usize;

        let mut new_shape = self.shape.clone();
        new_shape.swap(d1, d2);

        if self.shape.len() == 2 {
            let rows = self.shape[0];
            let cols = self.shape[1];
            let mut result = vec![0.0; rows * cols];
            for i in 0..rows {
                for j in 0..cols {
                    result[j * rows + i] = self.data[i * cols + j];
                }
            }
            return Tensor::new(result, new_shape);
        }

        // Walk the output in row-major order and gather from the input
        let mut permuted_strides = self.strides.clone();
        permuted_strides.swap(d1, d2);
        let out_strides = Self::compute_strides(&new_shape);

        let result: Vec<f32> = (0..self.data.len())
            .into_par_iter()
            .map(|i| {
                let mut remaining = i;
                let mut src = 0;
                for (dim, &stride) in out_strides.iter().enumerate() {
                    let coord = remaining / stride;
                    remaining %= stride;
                    src += coord * permuted_strides[dim];
                }
                self.data[src]
            })
            .collect();

        Tensor::new(result, new_shape)
    }

    /// Replace values where mask is non-zero with `value`
    ///
    /// The mask either matches the tensor shape or covers its trailing
    /// dimensions and is broadcast over the leading ones (a `[seq, seq]`
    /// causal mask applied to `[batch, heads, seq, seq]` scores).
    pub fn masked_fill(&self, mask: &Tensor, value: f32) -> Tensor {
        let trailing = &self.shape[self.shape.len().saturating_sub(mask.shape.len())..];
        assert_eq!(
            trailing,
            &mask.shape[..],
            "Mask shape {:?} does not broadcast to {:?}",
            mask.shape,
            self.shape
        );
        let plane = mask.data.len().max(1);
        let result = self
            .data
            .par_iter()
            .enumerate()
            .map(|(i, &x)| if mask.data[i % plane] != 0.0 { value } else { x })
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Mean along the last axis, keeping it as size 1
    pub fn mean_last(&self) -> Tensor {
        let cols = self.last_dim();
        let result: Vec<f32> = self
            .data
            .par_chunks(cols.max(1))
            .map(|row| row.iter().sum::<f32>() / cols as f32)
            .collect();
        Tensor::new(result, self.reduced_last_shape())
    }

    /// Population variance along the last axis, keeping it as size 1
    pub fn var_last(&self) -> Tensor {
        let cols = self.last_dim();
        let result: Vec<f32> = self
            .data
            .par_chunks(cols.max(1))
            .map(|row| {
                let mean = row.iter().sum::<f32>() / cols as f32;
                row.iter()
                    .map(|&x| {
                        let diff = x - mean;
                        diff * diff
                    })
                    .sum::<f32>()
                    / cols as f32
            })
            .collect();
        Tensor::new(result, self.reduced_last_shape())
    }

    fn reduced_last_shape(&self) -> Vec<usize> {
        let mut shape = self.shape.clone();
        if let Some(last) = shape.last_mut() {
            *last = 1;
        }
        shape
    }

    /// Number of elements whose magnitude exceeds `threshold`
    pub fn count_above(&self, threshold: f32) -> u64 {
        self.data
            .par_iter()
            .filter(|x| x.abs() > threshold)
            .count() as u64
    }

    /// Count elements with `|x| > threshold`, reducing every axis not in `keep`
    ///
    /// The result has the kept axes in their original order, e.g. keeping
    /// axes `[0, 2]` of a `[B, S, H, D]` tensor yields a `[B, H]` count grid.
    pub fn count_above_by_axes(&self, threshold: f32, keep: &[usize]) -> Tensor {
        self.count_by_axes(keep, |x| x.abs() > threshold)
    }

    /// Count nonzero elements, reducing every axis not in `keep`
    pub fn count_nonzero_by_axes(&self, keep: &[usize]) -> Tensor {
        self.count_by_axes(keep, |x| x != 0.0)
    }

    fn count_by_axes<P>(&self, keep: &[usize], pred: P) -> Tensor
    where
        P: Fn(f32) -> bool + Sync,
    {
        assert!(
            keep.iter().all(|&axis| axis < self.shape.len()),
            "Axes {:?} out of range for shape {:?}",
            keep,
            self.shape
        );

        let out_shape: Vec<usize> = keep.iter().map(|&axis| self.shape[axis]).collect();
        let out_strides = Self::compute_strides(&out_shape);
        let out_len: usize = out_shape.iter().product();

        let counts = self
            .data
            .par_iter()
            .enumerate()
            .fold(
                || vec![0.0f32; out_len],
                |mut acc, (i, &x)| {
                    if pred(x) {
                        let mut out_idx = 0;
                        for (k, &axis) in keep.iter().enumerate() {
                            let coord = (i / self.strides[axis]) % self.shape[axis];
                            out_idx += coord * out_strides[k];
                        }
                        acc[out_idx] += 1.0;
                    }
                    acc
                },
            )
            .reduce(
                || vec![0.0f32; out_len],
                |mut a, b| {
                    a.iter_mut().zip(b).for_each(|(x, y)| *x += y);
                    a
                },
            );

        Tensor::new(counts, out_shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_matmul_2d_small_and_blocked_agree() {
        let a = Tensor::new((0..12).map(|i| i as f32).collect(), vec![3, 4]);
        let b = Tensor::new((0..8).map(|i| i as f32 * 0.5).collect(), vec![4, 2]);
        let c = a.matmul(&b);
        assert_eq!(c.shape, vec![3, 2]);
        assert_relative_eq!(c.data[0], 14.0);

        let big_a = Tensor::new((0..400).map(|i| (i % 7) as f32).collect(), vec![20, 20]);
        let big_b = Tensor::new((0..400).map(|i| (i % 5) as f32).collect(), vec![20, 20]);
        let blocked = big_a.matmul(&big_b);
        let reference = big_a.matmul_t(&big_b.transpose(0, 1));
        for (x, y) in blocked.data.iter().zip(&reference.data) {
            assert_relative_eq!(x, y, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_matmul_t_matches_matmul() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let w = Tensor::new(vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0], vec![2, 3]);
        let out = a.matmul_t(&w);
        assert_eq!(out.shape, vec![2, 2]);
        assert_eq!(out.data, vec![4.0, 2.0, 10.0, 5.0]);
    }

    #[test]
    fn test_batched_matmul() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 1, 2, 2]);
        let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0], vec![1, 1, 2, 2]);
        assert_eq!(a.matmul(&b).data, a.data);
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 0.0, 0.0, f32::NEG_INFINITY], vec![1, 2, 3]);
        let s = t.softmax_last();
        assert_relative_eq!(s.data[0..3].iter().sum::<f32>(), 1.0, epsilon = 1e-6);
        assert_relative_eq!(s.data[3], 0.5, epsilon = 1e-6);
        assert_eq!(s.data[5], 0.0);
    }

    #[test]
    fn test_masked_fill_broadcasts_trailing_dims() {
        let scores = Tensor::zeros(vec![2, 1, 2, 2]);
        let mask = Tensor::new(vec![0.0, 1.0, 0.0, 0.0], vec![2, 2]);
        let filled = scores.masked_fill(&mask, -1.0);
        assert_eq!(filled.data, vec![0.0, -1.0, 0.0, 0.0, 0.0, -1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_transpose_4d() {
        let t = Tensor::new((0..24).map(|i| i as f32).collect(), vec![1, 2, 3, 4]);
        let tt = t.transpose(2, 3);
        assert_eq!(tt.shape, vec![1, 2, 4, 3]);
        // element [0, 0, 1, 2] moves to [0, 0, 2, 1]
        assert_eq!(tt.data[2 * 3 + 1], 6.0);
        assert_eq!(tt.data[12 + 2 * 3 + 1], 18.0);
    }

    #[test]
    fn test_mean_and_var_last_axis() {
        let t = Tensor::new(vec![1.0, 3.0, 2.0, 2.0], vec![2, 2]);
        assert_eq!(t.mean_last().data, vec![2.0, 2.0]);
        assert_eq!(t.var_last().data, vec![1.0, 0.0]);
        assert_eq!(t.var_last().shape, vec![2, 1]);
    }

    #[test]
    fn test_try_reshape_rejects_mismatch() {
        let t = Tensor::zeros(vec![2, 3]);
        assert!(t.try_reshape(&[4, 2]).is_err());
        assert_eq!(t.try_reshape(&[3, 2]).unwrap().shape, vec![3, 2]);
    }

    #[test]
    fn test_count_above_by_axes_per_head() {
        // [B=1, S=2, H=2, D=2]
        let t = Tensor::new(
            vec![0.5, 0.0, 0.0, 0.0, 0.5, 0.5, 0.0, 0.2],
            vec![1, 2, 2, 2],
        );
        let per_head = t.count_above_by_axes(0.1, &[0, 2]);
        assert_eq!(per_head.shape, vec![1, 2]);
        assert_eq!(per_head.data, vec![3.0, 1.0]);
        assert_eq!(t.count_above(0.1), 4);
    }
}
