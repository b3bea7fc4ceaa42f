//! Layer Normalization
//!
//! Normalizes activations along the last dimension to zero mean and unit
//! variance, then applies the learned scale and shift:
//!
//! ```text
//! y = (x - mean) / √(var + ε) * γ + β
//! ```
//!
//! OPT uses ε = 1e-5. Checkpoints built with
//! `layer_norm_elementwise_affine = false` carry no γ/β.

use crate::error::Result;
use crate::hooks::{emit, ForwardObserver, ModuleOutput};
use crate::tensor::Tensor;
use crate::weights::WeightSource;
use rayon::prelude::*;

/// Layer normalization over the last dimension
pub struct LayerNorm {
    pub name: String,
    /// Scale parameter γ: [dim]
    pub weight: Option<Tensor>,
    /// Shift parameter β: [dim]
    pub bias: Option<Tensor>,
    pub eps: f32,
}

impl LayerNorm {
    /// Identity-initialized layer norm (γ = 1, β = 0)
    pub fn new(name: impl Into<String>, dim: usize, affine: bool) -> Self {
        Self {
            name: name.into(),
            weight: affine.then(|| Tensor::full(vec![dim], 1.0)),
            bias: affine.then(|| Tensor::zeros(vec![dim])),
            eps: 1e-5,
        }
    }

    /// Load `{name}.weight` / `{name}.bias` when `affine` is set
    pub fn load(source: &dyn WeightSource, name: impl Into<String>, affine: bool) -> Result<Self> {
        let name = name.into();
        let (weight, bias) = if affine {
            (
                Some(source.tensor(&format!("{name}.weight"))?),
                Some(source.tensor(&format!("{name}.bias"))?),
            )
        } else {
            (None, None)
        };
        Ok(Self {
            name,
            weight,
            bias,
            eps: 1e-5,
        })
    }

    /// Forward pass: normalize along the last dimension
    pub fn forward(&self, x: &Tensor, observer: &mut dyn ForwardObserver) -> Result<Tensor> {
        let cols = x.last_dim();
        let mean = x.mean_last();
        let var = x.var_last();

        let mut normalized = x.data.clone();
        normalized
            .par_chunks_mut(cols.max(1))
            .zip(mean.data.par_iter().zip(var.data.par_iter()))
            .for_each(|(row, (&m, &v))| {
                let inv_std = 1.0 / (v + self.eps).sqrt();
                row.iter_mut().for_each(|val| *val = (*val - m) * inv_std);
            });
        let mut y = Tensor::new(normalized, x.shape.clone());

        if let Some(weight) = &self.weight {
            y = y.mul(weight);
        }
        if let Some(bias) = &self.bias {
            y = y.add(bias);
        }

        emit(observer, &self.name, &[x], ModuleOutput::Tensor(&y))?;
        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoHooks;
    use approx::assert_relative_eq;

    #[test]
    fn test_normalizes_each_row() {
        let ln = LayerNorm::new("ln", 4, true);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 10.0, 10.0, 10.0, 10.0], vec![2, 4]);
        let y = ln.forward(&x, &mut NoHooks).unwrap();

        let row0 = &y.data[0..4];
        assert_relative_eq!(row0.iter().sum::<f32>(), 0.0, epsilon = 1e-5);
        let var: f32 = row0.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert_relative_eq!(var, 1.0, epsilon = 1e-3);

        // Constant rows collapse to β
        assert!(y.data[4..8].iter().all(|v| v.abs() < 1e-3));
    }

    #[test]
    fn test_affine_parameters_apply() {
        let mut ln = LayerNorm::new("ln", 2, true);
        ln.weight = Some(Tensor::new(vec![2.0, 2.0], vec![2]));
        ln.bias = Some(Tensor::new(vec![1.0, 1.0], vec![2]));
        let y = ln.forward(&Tensor::new(vec![-1.0, 1.0], vec![1, 2]), &mut NoHooks).unwrap();
        assert_relative_eq!(y.data[0], -1.0, epsilon = 1e-3);
        assert_relative_eq!(y.data[1], 3.0, epsilon = 1e-3);
    }
}
