//! Feedforward Network
//!
//! The per-layer feedforward block of OPT:
//!
//! ```text
//! fc1 [hidden → ffn_dim] → activation_fn → fc2 [ffn_dim → hidden]
//! ```
//!
//! OPT runs this block on the flattened `[batch * seq, hidden]` state, so
//! the `activation_fn` hook sees a 2D `[tokens, ffn_dim]` tensor: one row
//! per token, one column per feature.
//!
//! `fc1`, `activation_fn` and `fc2` are direct children of the decoder layer
//! in the checkpoint naming (`layers.{i}.fc1`), so this struct adds no name
//! of its own.

use crate::error::Result;
use crate::hooks::ForwardObserver;
use crate::tensor::Tensor;
use crate::weights::WeightSource;
use rand::Rng;

use super::activation::{Activation, ActivationFn};
use super::linear::Linear;

pub struct FeedForward {
    pub fc1: Linear,
    pub activation_fn: ActivationFn,
    pub fc2: Linear,
}

impl FeedForward {
    pub fn random<R: Rng + ?Sized>(
        prefix: &str,
        hidden: usize,
        ffn_dim: usize,
        activation: Activation,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            fc1: Linear::random(format!("{prefix}.fc1"), hidden, ffn_dim, bias, rng),
            activation_fn: ActivationFn::new(format!("{prefix}.activation_fn"), activation),
            fc2: Linear::random(format!("{prefix}.fc2"), ffn_dim, hidden, bias, rng),
        }
    }

    pub fn load(
        source: &dyn WeightSource,
        prefix: &str,
        activation: Activation,
        bias: bool,
    ) -> Result<Self> {
        Ok(Self {
            fc1: Linear::load(source, format!("{prefix}.fc1"), bias)?,
            activation_fn: ActivationFn::new(format!("{prefix}.activation_fn"), activation),
            fc2: Linear::load(source, format!("{prefix}.fc2"), bias)?,
        })
    }

    pub fn module_names(&self) -> Vec<String> {
        vec![
            self.fc1.name.clone(),
            self.activation_fn.name.clone(),
            self.fc2.name.clone(),
        ]
    }

    /// Forward pass: expand → activate → project
    pub fn forward(&self, x: &Tensor, observer: &mut dyn ForwardObserver) -> Result<Tensor> {
        let h = self.fc1.forward(x, observer)?;
        let h = self.activation_fn.forward(&h, observer)?;
        self.fc2.forward(&h, observer)
    }
}
