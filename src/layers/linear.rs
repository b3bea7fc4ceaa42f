//! Linear Layer (Fully Connected)
//!
//! Performs the affine transformation `y = x @ W^T + b`.
//!
//! ## Weight Layout
//!
//! ```text
//! Input:  x [*, in_features]
//! Weight: W [out_features, in_features]   (checkpoint layout)
//! Bias:   b [out_features]
//! Output: y [*, out_features]
//! ```
//!
//! Weights keep the checkpoint's `[out, in]` layout and are applied with
//! [`Tensor::matmul_t`], so loading a multi-gigabyte checkpoint never needs a
//! transpose pass. Any number of leading dimensions is accepted: the input is
//! flattened to 2D, multiplied, and reshaped back.

use crate::error::Result;
use crate::hooks::{emit, ForwardObserver, ModuleOutput};
use crate::tensor::Tensor;
use crate::weights::WeightSource;
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Sample a tensor from N(0, std²)
///
/// OPT (like GPT-2) initializes projection weights with std 0.02.
pub fn normal_tensor<R: Rng + ?Sized>(rng: &mut R, shape: Vec<usize>, std: f32) -> Tensor {
    let size: usize = shape.iter().product();
    let normal = Normal::new(0.0, std).expect("standard deviation must be finite");
    let data: Vec<f32> = (0..size).map(|_| normal.sample(rng)).collect();
    Tensor::new(data, shape)
}

/// Linear layer (fully connected)
pub struct Linear {
    /// Hook name, e.g. `model.decoder.layers.0.fc1`
    pub name: String,
    /// Weight matrix: [out_features, in_features]
    pub weight: Tensor,
    /// Bias vector: [out_features]
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Create a randomly initialized layer (weights N(0, 0.02), zero bias)
    pub fn random<R: Rng + ?Sized>(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            name: name.into(),
            weight: normal_tensor(rng, vec![out_features, in_features], 0.02),
            bias: bias.then(|| Tensor::zeros(vec![out_features])),
        }
    }

    /// Load `{name}.weight` and, when `bias` is set, `{name}.bias`
    pub fn load(source: &dyn WeightSource, name: impl Into<String>, bias: bool) -> Result<Self> {
        let name = name.into();
        let weight = source.tensor(&format!("{name}.weight"))?;
        let bias = if bias {
            Some(source.tensor(&format!("{name}.bias"))?)
        } else {
            None
        };
        Ok(Self { name, weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape[1]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[0]
    }

    /// Forward pass: y = x @ W^T + b
    ///
    /// # Arguments
    ///
    /// * `x` - Input tensor [..., in_features]
    /// * `observer` - Receives this module's call
    ///
    /// # Returns
    ///
    /// Output tensor [..., out_features]
    pub fn forward(&self, x: &Tensor, observer: &mut dyn ForwardObserver) -> Result<Tensor> {
        let y_2d = x.flatten_to_2d().matmul_t(&self.weight);
        let y_2d = match &self.bias {
            Some(bias) => y_2d.add(bias),
            None => y_2d,
        };

        let mut out_shape = x.shape.clone();
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }
        let y = y_2d.reshape(&out_shape);

        emit(observer, &self.name, &[x], ModuleOutput::Tensor(&y))?;
        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoHooks;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_forward_keeps_leading_dims() {
        let layer = Linear {
            name: "proj".to_string(),
            weight: Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]),
            bias: Some(Tensor::new(vec![0.0, 0.0, 10.0], vec![3])),
        };
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 2, 2]);
        let y = layer.forward(&x, &mut NoHooks).unwrap();
        assert_eq!(y.shape, vec![1, 2, 3]);
        assert_eq!(y.data, vec![1.0, 2.0, 13.0, 3.0, 4.0, 17.0]);
    }

    #[test]
    fn test_random_init_shapes() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Linear::random("fc1", 8, 16, false, &mut rng);
        assert_eq!(layer.in_features(), 8);
        assert_eq!(layer.out_features(), 16);
        assert!(layer.bias.is_none());
        assert!(layer.weight.data.iter().any(|&w| w != 0.0));
    }
}
