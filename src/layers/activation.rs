//! Activation Functions
//!
//! OPT checkpoints use ReLU between `fc1` and `fc2`, which is what makes
//! their feedforward activations sparse in the first place. GELU is
//! supported for configurations that ask for it.
//!
//! ## GELU Approximation
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! The activation is its own hookable module (`*.activation_fn`), so hooks
//! see the post-activation tensor directly.

use crate::error::{Error, Result};
use crate::hooks::{emit, ForwardObserver, ModuleOutput};
use crate::tensor::Tensor;
use std::str::FromStr;

/// Activation kind named by `activation_function` in the model config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Gelu,
}

impl FromStr for Activation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relu" => Ok(Activation::Relu),
            "gelu" | "gelu_new" | "gelu_pytorch_tanh" => Ok(Activation::Gelu),
            other => Err(Error::config(format!("unsupported activation `{other}`"))),
        }
    }
}

/// ReLU: max(0, x)
pub fn relu(x: &Tensor) -> Tensor {
    x.map(|v| v.max(0.0))
}

/// GELU with the tanh approximation
pub fn gelu(x: &Tensor) -> Tensor {
    let sqrt_2_over_pi = (2.0_f32 / std::f32::consts::PI).sqrt();
    x.map(move |v| 0.5 * v * (1.0 + (sqrt_2_over_pi * (v + 0.044715 * v * v * v)).tanh()))
}

/// Hookable activation module
pub struct ActivationFn {
    pub name: String,
    pub kind: Activation,
}

impl ActivationFn {
    pub fn new(name: impl Into<String>, kind: Activation) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn forward(&self, x: &Tensor, observer: &mut dyn ForwardObserver) -> Result<Tensor> {
        let y = match self.kind {
            Activation::Relu => relu(x),
            Activation::Gelu => gelu(x),
        };
        emit(observer, &self.name, &[x], ModuleOutput::Tensor(&y))?;
        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_relu_zeroes_negatives() {
        let y = relu(&Tensor::new(vec![-1.0, 0.0, 2.5], vec![3]));
        assert_eq!(y.data, vec![0.0, 0.0, 2.5]);
    }

    #[test]
    fn test_gelu_reference_points() {
        let y = gelu(&Tensor::new(vec![0.0, 1.0, -1.0], vec![3]));
        assert_eq!(y.data[0], 0.0);
        assert_relative_eq!(y.data[1], 0.8412, epsilon = 1e-3);
        assert_relative_eq!(y.data[2], -0.1588, epsilon = 1e-3);
    }

    #[test]
    fn test_parse_activation() {
        assert_eq!("relu".parse::<Activation>().unwrap(), Activation::Relu);
        assert_eq!("gelu_new".parse::<Activation>().unwrap(), Activation::Gelu);
        assert!("swish".parse::<Activation>().is_err());
    }
}
