//! OPT Decoder Layer
//!
//! ## Architecture (pre-norm, `do_layer_norm_before = true`)
//!
//! ```text
//! x → self_attn_layer_norm → self_attn → (+) → flatten → final_layer_norm → fc1 → act → fc2 → (+) → unflatten
//! │                                        ↑      │                                            ↑
//! └────────────────────────────────────────┘      └────────────────────────────────────────────┘
//! ```
//!
//! With `do_layer_norm_before = false` (opt-350m) each layer norm moves
//! after its residual addition instead.
//!
//! The layer itself is hookable (`model.decoder.layers.{i}`) and, like the
//! reference implementation, reports a tuple output.

use crate::config::OptConfig;
use crate::error::Result;
use crate::hooks::{emit, ForwardObserver, ModuleOutput};
use crate::tensor::Tensor;
use crate::weights::WeightSource;
use rand::Rng;

use super::activation::Activation;
use super::attention::Attention;
use super::layer_norm::LayerNorm;
use super::mlp::FeedForward;

/// Single decoder layer
pub struct DecoderLayer {
    pub name: String,
    pub self_attn_layer_norm: LayerNorm,
    pub self_attn: Attention,
    pub final_layer_norm: LayerNorm,
    pub ffn: FeedForward,
    pub pre_norm: bool,
}

impl DecoderLayer {
    pub fn random<R: Rng + ?Sized>(
        name: impl Into<String>,
        config: &OptConfig,
        activation: Activation,
        rng: &mut R,
    ) -> Self {
        let name = name.into();
        let hidden = config.hidden_size;
        let affine = config.layer_norm_elementwise_affine;
        Self {
            self_attn_layer_norm: LayerNorm::new(format!("{name}.self_attn_layer_norm"), hidden, affine),
            self_attn: Attention::random(
                format!("{name}.self_attn"),
                hidden,
                config.num_attention_heads,
                config.enable_bias,
                rng,
            ),
            final_layer_norm: LayerNorm::new(format!("{name}.final_layer_norm"), hidden, affine),
            ffn: FeedForward::random(&name, hidden, config.ffn_dim, activation, config.enable_bias, rng),
            pre_norm: config.do_layer_norm_before,
            name,
        }
    }

    pub fn load(
        source: &dyn WeightSource,
        name: impl Into<String>,
        config: &OptConfig,
        activation: Activation,
    ) -> Result<Self> {
        let name = name.into();
        let affine = config.layer_norm_elementwise_affine;
        Ok(Self {
            self_attn_layer_norm: LayerNorm::load(
                source,
                format!("{name}.self_attn_layer_norm"),
                affine,
            )?,
            self_attn: Attention::load(
                source,
                format!("{name}.self_attn"),
                config.hidden_size,
                config.num_attention_heads,
                config.enable_bias,
            )?,
            final_layer_norm: LayerNorm::load(source, format!("{name}.final_layer_norm"), affine)?,
            ffn: FeedForward::load(source, &name, activation, config.enable_bias)?,
            pre_norm: config.do_layer_norm_before,
            name,
        })
    }

    /// Submodule names in execution order, ending with the layer itself
    pub fn module_names(&self) -> Vec<String> {
        let mut names = vec![self.self_attn_layer_norm.name.clone()];
        names.extend(self.self_attn.module_names());
        names.push(self.final_layer_norm.name.clone());
        names.extend(self.ffn.module_names());
        names.push(self.name.clone());
        names
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `x` - Hidden state [batch, seq_len, hidden]
    ///
    /// # Returns
    ///
    /// Hidden state [batch, seq_len, hidden]
    pub fn forward(&self, x: &Tensor, observer: &mut dyn ForwardObserver) -> Result<Tensor> {
        // === Self-attention with residual ===
        let h = if self.pre_norm {
            self.self_attn_layer_norm.forward(x, observer)?
        } else {
            x.clone()
        };
        let h = self.self_attn.forward(&h, observer)?;
        let mut h = x.add(&h);
        if !self.pre_norm {
            h = self.self_attn_layer_norm.forward(&h, observer)?;
        }

        // === Feedforward with residual, on [batch * seq, hidden] ===
        let shape = h.shape.clone();
        let residual = h.flatten_to_2d();
        let f = if self.pre_norm {
            self.final_layer_norm.forward(&residual, observer)?
        } else {
            residual.clone()
        };
        let f = self.ffn.forward(&f, observer)?;
        let mut out = residual.add(&f).reshape(&shape);
        if !self.pre_norm {
            out = self.final_layer_norm.forward(&out, observer)?;
        }

        emit(observer, &self.name, &[x], ModuleOutput::Tuple(vec![&out]))?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::ModuleCall;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Shapes(Vec<(String, Vec<usize>)>);

    impl ForwardObserver for Shapes {
        fn observe(&mut self, call: &ModuleCall<'_>) -> Result<()> {
            let shape = call.output.primary_shape().unwrap_or(&[]).to_vec();
            self.0.push((call.name.to_string(), shape));
            Ok(())
        }
    }

    #[test]
    fn test_activation_output_is_flattened() {
        let config = OptConfig::tiny(16);
        let mut rng = StdRng::seed_from_u64(11);
        let layer = DecoderLayer::random("layers.0", &config, Activation::Relu, &mut rng);
        let x = Tensor::zeros(vec![2, 3, config.hidden_size]);

        let mut shapes = Shapes(Vec::new());
        let y = layer.forward(&x, &mut shapes).unwrap();
        assert_eq!(y.shape, x.shape);

        let act = shapes
            .0
            .iter()
            .find(|(name, _)| name == "layers.0.activation_fn")
            .unwrap();
        assert_eq!(act.1, vec![6, config.ffn_dim]);

        let names: Vec<String> = shapes.0.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, layer.module_names());
    }

    #[test]
    fn test_post_norm_layer_runs() {
        let config = OptConfig {
            do_layer_norm_before: false,
            ..OptConfig::tiny(16)
        };
        let mut rng = StdRng::seed_from_u64(12);
        let layer = DecoderLayer::random("layers.0", &config, Activation::Relu, &mut rng);
        let x = Tensor::full(vec![1, 2, config.hidden_size], 0.5);
        let mut shapes = Shapes(Vec::new());
        let y = layer.forward(&x, &mut shapes).unwrap();
        assert_eq!(y.shape, x.shape);
        assert_eq!(shapes.0.last().unwrap().0, "layers.0");
    }
}
