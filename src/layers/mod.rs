//! Neural Network Layers
//!
//! The building blocks of the OPT decoder. Every layer is forward-only and
//! reports its call to a [`ForwardObserver`](crate::hooks::ForwardObserver)
//! under its Hugging Face module name.
//!
//! ## Layers
//!
//! - **activation**: ReLU / GELU as a hookable `activation_fn` module
//! - **linear**: Fully connected layer
//! - **layer_norm**: Layer normalization
//! - **embedding**: Token and learned position embeddings
//! - **mlp**: `fc1 → activation_fn → fc2`
//! - **attention**: Multi-head causal self-attention
//! - **block**: Complete decoder layer
//!
//! ## Design Pattern
//!
//! Each layer follows a consistent pattern:
//!
//! ```rust,ignore
//! pub struct Layer {
//!     pub name: String,
//!     // Parameters (weights, biases, etc.)
//! }
//!
//! impl Layer {
//!     pub fn random(name, ..., rng) -> Self { }
//!     pub fn load(source: &dyn WeightSource, name, ...) -> Result<Self> { }
//!     pub fn forward(&self, x: &Tensor, observer: &mut dyn ForwardObserver) -> Result<Tensor> { }
//! }
//! ```
//!
//! `forward` computes its output, then emits `(name, inputs, output)`.

pub mod activation;
pub mod attention;
pub mod block;
pub mod embedding;
pub mod layer_norm;
pub mod linear;
pub mod mlp;

// Re-export main types for convenience
pub use activation::{gelu, relu, Activation, ActivationFn};
pub use attention::{causal_mask, Attention};
pub use block::DecoderLayer;
pub use embedding::{Embedding, POSITION_OFFSET};
pub use layer_norm::LayerNorm;
pub use linear::{normal_tensor, Linear};
pub use mlp::FeedForward;
