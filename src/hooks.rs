//! Forward hooks on named submodules
//!
//! Every submodule of [`OptModel`](crate::OptModel) reports a
//! [`ModuleCall`] to a [`ForwardObserver`] right after its forward pass,
//! carrying the module's name, its inputs and its output. Observers decide
//! per name whether they care ([`ForwardObserver::is_hooked`]), so unhooked
//! modules cost nothing.
//!
//! Names follow the Hugging Face OPT layout, e.g.
//! `model.decoder.layers.3.self_attn.out_proj` or
//! `model.decoder.layers.3.activation_fn`.
//!
//! Hooks observe only; they never replace or modify activations.

use crate::error::Result;
use crate::tensor::Tensor;
use std::collections::BTreeMap;

/// Output of a submodule as seen by a hook
///
/// Leaf modules return a single tensor. Container modules (`self_attn`,
/// a whole decoder layer) return a tuple, matching the reference model
/// where attention returns `(output, weights, cache)`.
#[derive(Debug, Clone)]
pub enum ModuleOutput<'a> {
    Tensor(&'a Tensor),
    Tuple(Vec<&'a Tensor>),
}

impl<'a> ModuleOutput<'a> {
    /// The output as a single tensor, if it is one
    pub fn as_tensor(&self) -> Option<&'a Tensor> {
        match self {
            ModuleOutput::Tensor(t) => Some(t),
            ModuleOutput::Tuple(_) => None,
        }
    }

    /// Short description of the variant, used in error messages
    pub fn kind(&self) -> &'static str {
        match self {
            ModuleOutput::Tensor(_) => "tensor",
            ModuleOutput::Tuple(_) => "tuple",
        }
    }

    /// Shape of the first tensor in the output
    pub fn primary_shape(&self) -> Option<&'a [usize]> {
        match self {
            ModuleOutput::Tensor(t) => Some(&t.shape),
            ModuleOutput::Tuple(items) => items.first().map(|t| t.shape.as_slice()),
        }
    }
}

/// One invocation of a submodule, delivered after it has run
#[derive(Debug, Clone)]
pub struct ModuleCall<'a> {
    pub name: &'a str,
    pub inputs: &'a [&'a Tensor],
    pub output: ModuleOutput<'a>,
}

/// Receives module calls during a forward pass
///
/// Calls arrive synchronously and in execution order on the thread running
/// the forward pass. An error aborts the forward pass.
pub trait ForwardObserver {
    /// Whether `name` has a hook attached
    fn is_hooked(&self, _name: &str) -> bool {
        true
    }

    /// Handle one module call
    fn observe(&mut self, call: &ModuleCall<'_>) -> Result<()>;
}

/// Observer with no hooks attached
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ForwardObserver for NoHooks {
    fn is_hooked(&self, _name: &str) -> bool {
        false
    }

    fn observe(&mut self, _call: &ModuleCall<'_>) -> Result<()> {
        Ok(())
    }
}

/// Report a module call to `observer` if the module is hooked
pub fn emit(
    observer: &mut dyn ForwardObserver,
    name: &str,
    inputs: &[&Tensor],
    output: ModuleOutput<'_>,
) -> Result<()> {
    if !observer.is_hooked(name) {
        return Ok(());
    }
    observer.observe(&ModuleCall {
        name,
        inputs,
        output,
    })
}

/// What a registered hook does when its module fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    /// Record the call (module name, call count, output shape) only
    Record,
    /// Per-head summary of the module's first input, split into `n_head` heads
    HeadSummary { n_head: usize },
    /// Activation summary of the module's output
    FcActSummary,
}

/// Registration table: submodule name to hook
#[derive(Debug, Default, Clone)]
pub struct HookTable {
    hooks: BTreeMap<String, Hook>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `hook` to `name`, replacing any previous hook
    pub fn register(&mut self, name: impl Into<String>, hook: Hook) {
        self.hooks.insert(name.into(), hook);
    }

    pub fn get(&self, name: &str) -> Option<Hook> {
        self.hooks.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Iterate registrations in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Hook)> {
        self.hooks.iter().map(|(name, hook)| (name.as_str(), *hook))
    }
}
