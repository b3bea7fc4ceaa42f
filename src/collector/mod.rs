//! Collectors: forward observers that gather statistics by module name
//!
//! - [`ModuleCollector`]: records every module call (count, output shape)
//! - [`OptCollector`]: adds fc activation and attention head sparsity
//!
//! A collector is registered against a model once, then passed as the
//! observer to every forward pass of the run.

pub mod module_collector;
pub mod opt;
pub mod sparsity;

pub use module_collector::{ModuleCollector, ModuleRecord, TensorDataInfo};
pub use opt::{CollectorState, OptCollector};
pub use sparsity::{SparsityCounter, SparsityReport};

use crate::error::Result;
use crate::hooks::ForwardObserver;
use crate::model::OptModel;

/// A forward observer that builds its hook table from a model
pub trait Collector: ForwardObserver {
    /// Attach hooks to every submodule of `model`
    fn register_hook(&mut self, model: &OptModel) -> Result<()>;

    /// Running counters, if this collector keeps any
    fn summary(&self) -> Option<SparsityReport> {
        None
    }

    /// End the run; collectors without counters report nothing
    fn finish(&mut self) -> Result<Option<SparsityReport>> {
        Ok(None)
    }
}
