//! Base collector: per-module call records and shared summary helpers
//!
//! [`ModuleCollector`] attaches a record-only hook to every named submodule
//! and keeps, per module, how often it ran and the shape it last produced.
//! Specialized collectors embed it and layer their own summaries on top of
//! [`ModuleCollector::record`], reusing its snapshot, counter and plotting
//! helpers.

use crate::collector::{Collector, SparsityCounter};
use crate::error::Result;
use crate::hooks::{ForwardObserver, Hook, HookTable, ModuleCall};
use crate::model::OptModel;
use crate::plot::Plotter;
use crate::tensor::Tensor;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// What the base hook remembers about one module
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub calls: u64,
    pub output_shape: Vec<usize>,
}

/// Snapshot of one tensor at one hook call
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDataInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub numel: u64,
    /// Elements with `|x| > threshold`
    pub above: u64,
    pub threshold: f32,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub abs_mean: f32,
    /// One-line description, used as a plot title
    pub fmt: String,
}

#[derive(Clone, Copy)]
struct Moments {
    min: f32,
    max: f32,
    sum: f64,
    abs_sum: f64,
}

impl Moments {
    const EMPTY: Moments = Moments {
        min: f32::INFINITY,
        max: f32::NEG_INFINITY,
        sum: 0.0,
        abs_sum: 0.0,
    };

    fn push(mut self, x: f32) -> Self {
        self.min = self.min.min(x);
        self.max = self.max.max(x);
        self.sum += x as f64;
        self.abs_sum += x.abs() as f64;
        self
    }

    fn merge(self, other: Self) -> Self {
        Moments {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
            sum: self.sum + other.sum,
            abs_sum: self.abs_sum + other.abs_sum,
        }
    }
}

/// Record-only collector
pub struct ModuleCollector {
    hooks: HookTable,
    records: BTreeMap<String, ModuleRecord>,
    plotter: Plotter,
}

impl ModuleCollector {
    pub fn new(plotter: Plotter) -> Self {
        Self {
            hooks: HookTable::new(),
            records: BTreeMap::new(),
            plotter,
        }
    }

    /// Default hook: record the call only
    pub fn get_hook(&self, _name: &str) -> Hook {
        Hook::Record
    }

    /// Attach `get_hook(name)` to every submodule `model` reports
    pub fn register_hooks_with<F>(&mut self, model: &OptModel, mut get_hook: F) -> Result<()>
    where
        F: FnMut(&str) -> Result<Hook>,
    {
        for name in model.named_modules() {
            let hook = get_hook(&name)?;
            self.hooks.register(name, hook);
        }
        debug!(hooks = self.hooks.len(), "hooks registered");
        Ok(())
    }

    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    pub fn records(&self) -> &BTreeMap<String, ModuleRecord> {
        &self.records
    }

    pub fn plotter(&self) -> &Plotter {
        &self.plotter
    }

    /// Base hook body, run first for every hooked call
    pub fn record(&mut self, call: &ModuleCall<'_>) {
        let record = self.records.entry(call.name.to_string()).or_default();
        record.calls += 1;
        if let Some(shape) = call.output.primary_shape() {
            record.output_shape = shape.to_vec();
        }
        trace!(module = call.name, calls = record.calls, shape = ?record.output_shape, "module call");
    }

    /// Summarize `tensor` against `threshold`
    pub fn tensor_data_info(&self, tensor: &Tensor, name: &str, threshold: f32) -> TensorDataInfo {
        let numel = tensor.numel() as u64;
        let above = tensor.count_above(threshold);
        let moments = tensor
            .data
            .par_iter()
            .fold(|| Moments::EMPTY, |m, &x| m.push(x))
            .reduce(|| Moments::EMPTY, Moments::merge);

        let (min, max, mean, abs_mean) = if numel == 0 {
            (0.0, 0.0, 0.0, 0.0)
        } else {
            (
                moments.min,
                moments.max,
                (moments.sum / numel as f64) as f32,
                (moments.abs_sum / numel as f64) as f32,
            )
        };
        let ratio = if numel == 0 {
            0.0
        } else {
            above as f64 / numel as f64
        };

        let fmt = format!(
            "{name} {:?} |x|>{threshold}: {above}/{numel} ({ratio:.4}) min={min:.4} max={max:.4} mean={mean:.4} abs_mean={abs_mean:.4}",
            tensor.shape
        );
        debug!(info = %fmt, "tensor data info");

        TensorDataInfo {
            name: name.to_string(),
            shape: tensor.shape.clone(),
            numel,
            above,
            threshold,
            min,
            max,
            mean,
            abs_mean,
            fmt,
        }
    }

    /// Fold a snapshot's above/total counts into `counter`
    pub fn update_sparsity_from_tensor_data_info(
        counter: &mut SparsityCounter,
        info: &TensorDataInfo,
    ) {
        counter.add(info.above, info.numel);
    }

    pub fn plt_hist(&self, values: &[f32], name: &str, title: &str) -> Result<()> {
        self.plotter.hist(values, name, title)?;
        Ok(())
    }

    pub fn plt_grid(&self, tensor: &Tensor, name: &str) -> Result<()> {
        self.plotter.grid(tensor, name)?;
        Ok(())
    }
}

impl ForwardObserver for ModuleCollector {
    fn is_hooked(&self, name: &str) -> bool {
        self.hooks.contains(name)
    }

    fn observe(&mut self, call: &ModuleCall<'_>) -> Result<()> {
        self.record(call);
        Ok(())
    }
}

impl Collector for ModuleCollector {
    fn register_hook(&mut self, model: &OptModel) -> Result<()> {
        self.register_hooks_with(model, |_| Ok(Hook::Record))
    }
}
