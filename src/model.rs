//! OPT Decoder Model
//!
//! Forward-only implementation of the OPT decoder, laid out with the Hugging
//! Face module names so hooks can be attached by name.
//!
//! ## Architecture Overview
//!
//! ```text
//! Input tokens [batch, seq_len]
//!     ↓
//! model.decoder.embed_tokens        [batch, seq_len, word_embed_proj_dim]
//!     ↓
//! model.decoder.project_in          (only when word_embed_proj_dim != hidden)
//!     + model.decoder.embed_positions [batch, seq_len, hidden]
//!     ↓
//! model.decoder.layers.0 … layers.{N-1}
//!     ↓
//! model.decoder.final_layer_norm    (pre-norm checkpoints only)
//!     ↓
//! model.decoder.project_out         (only when word_embed_proj_dim != hidden)
//!     ↓
//! lm_head → [batch, seq_len, vocab_size]
//! ```
//!
//! `lm_head` shares its weight with `embed_tokens` unless the checkpoint
//! carries a separate `lm_head.weight`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use opt_sparsity::{NoHooks, OptConfig, OptModel};
//!
//! let model = OptModel::random(&OptConfig::tiny(128), 42);
//! let logits = model.forward(&[vec![2, 17, 5]], &mut NoHooks).unwrap();
//! assert_eq!(logits.shape, vec![1, 3, 128]);
//! ```

use crate::config::OptConfig;
use crate::error::{Error, Result};
use crate::hooks::{emit, ForwardObserver, ModuleOutput};
use crate::layers::{Activation, DecoderLayer, Embedding, LayerNorm, Linear, POSITION_OFFSET};
use crate::tensor::Tensor;
use crate::weights::WeightSource;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

const PREFIX: &str = "model.decoder";

/// OPT causal language model
pub struct OptModel {
    pub config: OptConfig,
    pub embed_tokens: Embedding,
    pub embed_positions: Embedding,
    pub project_in: Option<Linear>,
    pub layers: Vec<DecoderLayer>,
    pub final_layer_norm: Option<LayerNorm>,
    pub project_out: Option<Linear>,
    /// Untied output projection; `None` means tied to `embed_tokens`
    pub lm_head: Option<Linear>,
}

impl OptModel {
    /// Randomly initialized model (weights N(0, 0.02), identity layer norms)
    pub fn random(config: &OptConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let activation = config
            .activation_function
            .parse::<Activation>()
            .unwrap_or(Activation::Relu);
        let hidden = config.hidden_size;
        let embed_dim = config.embed_dim();
        let projected = embed_dim != hidden;

        let embed_tokens = Embedding::random(
            format!("{PREFIX}.embed_tokens"),
            config.vocab_size,
            embed_dim,
            &mut rng,
        );
        let embed_positions = Embedding::random(
            format!("{PREFIX}.embed_positions"),
            config.max_position_embeddings + POSITION_OFFSET,
            hidden,
            &mut rng,
        );
        let project_in = projected
            .then(|| Linear::random(format!("{PREFIX}.project_in"), embed_dim, hidden, false, &mut rng));

        let layers = (0..config.num_hidden_layers)
            .map(|i| {
                DecoderLayer::random(format!("{PREFIX}.layers.{i}"), config, activation, &mut rng)
            })
            .collect();

        let final_layer_norm = config.has_final_layer_norm().then(|| {
            LayerNorm::new(
                format!("{PREFIX}.final_layer_norm"),
                hidden,
                config.layer_norm_elementwise_affine,
            )
        });
        let project_out = projected
            .then(|| Linear::random(format!("{PREFIX}.project_out"), hidden, embed_dim, false, &mut rng));

        Self {
            config: config.clone(),
            embed_tokens,
            embed_positions,
            project_in,
            layers,
            final_layer_norm,
            project_out,
            lm_head: None,
        }
    }

    /// Build the model from checkpoint weights
    pub fn load(config: &OptConfig, source: &dyn WeightSource) -> Result<Self> {
        config.validate()?;
        let activation: Activation = config.activation_function.parse()?;
        let projected = config.embed_dim() != config.hidden_size;

        let embed_tokens = Embedding::load(source, format!("{PREFIX}.embed_tokens"))?;
        let embed_positions = Embedding::load(source, format!("{PREFIX}.embed_positions"))?;
        let project_in = if projected {
            Some(Linear::load(source, format!("{PREFIX}.project_in"), false)?)
        } else {
            None
        };

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::load(
                source,
                format!("{PREFIX}.layers.{i}"),
                config,
                activation,
            )?);
        }

        let final_layer_norm = if config.has_final_layer_norm() {
            Some(LayerNorm::load(
                source,
                format!("{PREFIX}.final_layer_norm"),
                config.layer_norm_elementwise_affine,
            )?)
        } else {
            None
        };
        let project_out = if projected {
            Some(Linear::load(source, format!("{PREFIX}.project_out"), false)?)
        } else {
            None
        };

        let lm_head = match source.optional("lm_head.weight")? {
            Some(weight) => Some(Linear {
                name: "lm_head".to_string(),
                weight,
                bias: None,
            }),
            None => None,
        };

        info!(
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            heads = config.num_attention_heads,
            tied_lm_head = lm_head.is_none(),
            "loaded OPT weights"
        );

        Ok(Self {
            config: config.clone(),
            embed_tokens,
            embed_positions,
            project_in,
            layers,
            final_layer_norm,
            project_out,
            lm_head,
        })
    }

    /// Every hookable submodule name, in the order modules execute
    pub fn named_modules(&self) -> Vec<String> {
        let mut names = vec![self.embed_tokens.name.clone()];
        if let Some(project_in) = &self.project_in {
            names.push(project_in.name.clone());
        }
        names.push(self.embed_positions.name.clone());
        for layer in &self.layers {
            names.extend(layer.module_names());
        }
        if let Some(norm) = &self.final_layer_norm {
            names.push(norm.name.clone());
        }
        if let Some(project_out) = &self.project_out {
            names.push(project_out.name.clone());
        }
        names.push(PREFIX.to_string());
        names.push("model".to_string());
        names.push("lm_head".to_string());
        names
    }

    /// Every parameter tensor under its checkpoint name
    pub fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        fn linear<'a>(out: &mut Vec<(String, &'a Tensor)>, layer: &'a Linear) {
            out.push((format!("{}.weight", layer.name), &layer.weight));
            if let Some(bias) = &layer.bias {
                out.push((format!("{}.bias", layer.name), bias));
            }
        }
        fn norm<'a>(out: &mut Vec<(String, &'a Tensor)>, layer: &'a LayerNorm) {
            if let Some(weight) = &layer.weight {
                out.push((format!("{}.weight", layer.name), weight));
            }
            if let Some(bias) = &layer.bias {
                out.push((format!("{}.bias", layer.name), bias));
            }
        }

        let mut out = vec![
            (format!("{}.weight", self.embed_tokens.name), &self.embed_tokens.weight),
            (format!("{}.weight", self.embed_positions.name), &self.embed_positions.weight),
        ];
        if let Some(project_in) = &self.project_in {
            linear(&mut out, project_in);
        }
        for layer in &self.layers {
            norm(&mut out, &layer.self_attn_layer_norm);
            let attn = &layer.self_attn;
            for proj in [&attn.q_proj, &attn.k_proj, &attn.v_proj, &attn.out_proj] {
                linear(&mut out, proj);
            }
            norm(&mut out, &layer.final_layer_norm);
            linear(&mut out, &layer.ffn.fc1);
            linear(&mut out, &layer.ffn.fc2);
        }
        if let Some(final_norm) = &self.final_layer_norm {
            norm(&mut out, final_norm);
        }
        if let Some(project_out) = &self.project_out {
            linear(&mut out, project_out);
        }
        if let Some(lm_head) = &self.lm_head {
            linear(&mut out, lm_head);
        }
        out
    }

    /// Forward pass
    ///
    /// # Arguments
    ///
    /// * `token_ids` - Token IDs [batch, seq_len]; rows must have equal length
    /// * `observer` - Receives every submodule call in execution order
    ///
    /// # Returns
    ///
    /// Logits [batch, seq_len, vocab_size]
    pub fn forward(
        &self,
        token_ids: &[Vec<usize>],
        observer: &mut dyn ForwardObserver,
    ) -> Result<Tensor> {
        let batch_size = token_ids.len();
        let seq_len = token_ids.first().map_or(0, Vec::len);
        if batch_size == 0 || seq_len == 0 {
            return Err(Error::shape("forward pass needs a non-empty batch"));
        }
        if seq_len > self.config.max_position_embeddings {
            return Err(Error::shape(format!(
                "sequence length {} exceeds max_position_embeddings {}",
                seq_len, self.config.max_position_embeddings
            )));
        }

        // === Embeddings ===
        let mut x = self.embed_tokens.forward(token_ids, observer)?;
        if let Some(project_in) = &self.project_in {
            x = project_in.forward(&x, observer)?;
        }
        let positions = self
            .embed_positions
            .forward_positions(batch_size, seq_len, observer)?;
        x = x.add(&positions);

        // === Decoder layers ===
        for layer in &self.layers {
            x = layer.forward(&x, observer)?;
        }

        if let Some(norm) = &self.final_layer_norm {
            x = norm.forward(&x, observer)?;
        }
        if let Some(project_out) = &self.project_out {
            x = project_out.forward(&x, observer)?;
        }
        emit(observer, PREFIX, &[], ModuleOutput::Tuple(vec![&x]))?;
        emit(observer, "model", &[], ModuleOutput::Tuple(vec![&x]))?;

        // === Output projection ===
        let logits = match &self.lm_head {
            Some(lm_head) => lm_head.forward(&x, observer)?,
            None => {
                let logits = x
                    .flatten_to_2d()
                    .matmul_t(&self.embed_tokens.weight)
                    .reshape(&[batch_size, seq_len, self.embed_tokens.num_embeddings()]);
                emit(observer, "lm_head", &[&x], ModuleOutput::Tensor(&logits))?;
                logits
            }
        };

        Ok(logits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{ModuleCall, NoHooks};
    use crate::weights::MapSource;

    struct Order(Vec<String>);

    impl ForwardObserver for Order {
        fn observe(&mut self, call: &ModuleCall<'_>) -> Result<()> {
            self.0.push(call.name.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_logits_shape() {
        let config = OptConfig::tiny(50);
        let model = OptModel::random(&config, 1);
        let logits = model
            .forward(&[vec![2, 4, 6, 8], vec![1, 3, 5, 7]], &mut NoHooks)
            .unwrap();
        assert_eq!(logits.shape, vec![2, 4, 50]);
        assert!(logits.data.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_named_modules_match_execution_order() {
        let model = OptModel::random(&OptConfig::tiny(50), 2);
        let mut order = Order(Vec::new());
        model.forward(&[vec![2, 9, 9]], &mut order).unwrap();
        assert_eq!(order.0, model.named_modules());
        assert!(order
            .0
            .contains(&"model.decoder.layers.1.self_attn.out_proj".to_string()));
        assert!(order.0.contains(&"model.decoder.layers.0.activation_fn".to_string()));
    }

    #[test]
    fn test_projection_dims() {
        let config = OptConfig {
            word_embed_proj_dim: Some(16),
            ..OptConfig::tiny(50)
        };
        let model = OptModel::random(&config, 3);
        assert!(model.project_in.is_some() && model.project_out.is_some());
        let logits = model.forward(&[vec![2, 3]], &mut NoHooks).unwrap();
        assert_eq!(logits.shape, vec![1, 2, 50]);
    }

    #[test]
    fn test_sequence_longer_than_positions_fails() {
        let config = OptConfig::tiny(50);
        let model = OptModel::random(&config, 4);
        let ids = vec![vec![2; config.max_position_embeddings + 1]];
        assert!(matches!(
            model.forward(&ids, &mut NoHooks),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn test_load_from_random_weights() {
        let config = OptConfig::tiny(20);
        let reference = OptModel::random(&config, 5);

        // Second layer stored without the `model.` prefix
        let mut source = MapSource::new();
        for (name, tensor) in reference.named_parameters() {
            let name = if name.contains("layers.1.") {
                name.trim_start_matches("model.").to_string()
            } else {
                name
            };
            source.insert(name, tensor.clone());
        }

        let loaded = OptModel::load(&config, &source).unwrap();
        assert!(loaded.lm_head.is_none());

        let ids = [vec![2, 7, 11]];
        let a = reference.forward(&ids, &mut NoHooks).unwrap();
        let b = loaded.forward(&ids, &mut NoHooks).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_missing_layer_weight_fails_load() {
        let config = OptConfig::tiny(20);
        let reference = OptModel::random(&config, 6);
        let mut source = MapSource::new();
        for (name, tensor) in reference.named_parameters() {
            if name != "model.decoder.layers.0.fc2.weight" {
                source.insert(name, tensor.clone());
            }
        }
        assert!(matches!(
            OptModel::load(&config, &source),
            Err(Error::MissingWeight(name)) if name == "model.decoder.layers.0.fc2.weight"
        ));
    }
}
