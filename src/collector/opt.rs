//! OPT sparsity collector
//!
//! Measures two kinds of sparsity while an OPT model runs:
//!
//! - **fc**: the post-activation output of every `*.activation_fn`, counted
//!   against `fc_sparsity_threshold`
//! - **attn**: the merged attention heads entering every
//!   `*.self_attn.out_proj`, counted against `attn_sparsity_threshold`
//!
//! Counts accumulate over every forward pass until the run is finished.
//!
//! ## Example
//!
//! ```rust,no_run
//! use opt_sparsity::{Collector, CollectorConfig, OptCollector, OptConfig, OptModel};
//!
//! let model = OptModel::random(&OptConfig::tiny(64), 0);
//! let mut collector = OptCollector::new(CollectorConfig::default());
//! collector.register_hook(&model)?;
//! model.forward(&[vec![2, 10, 11, 12]], &mut collector)?;
//! for line in collector.report()?.lines()? {
//!     println!("{line}");
//! }
//! # Ok::<(), opt_sparsity::Error>(())
//! ```

use crate::collector::module_collector::{ModuleCollector, TensorDataInfo};
use crate::collector::{Collector, SparsityCounter, SparsityReport};
use crate::config::CollectorConfig;
use crate::error::{Error, Result};
use crate::hooks::{ForwardObserver, Hook, ModuleCall, ModuleOutput};
use crate::model::OptModel;
use crate::plot::Plotter;
use crate::tensor::Tensor;
use tracing::info;

const OUT_PROJ_SUFFIX: &str = ".self_attn.out_proj";
const ACTIVATION_SUFFIX: &str = ".activation_fn";

/// Lifecycle of a collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorState {
    /// Head count unknown; hooks cannot be built yet
    Unconfigured,
    /// Hooks registered, nothing counted yet
    Configured,
    /// At least one hooked module has been counted
    Accumulating,
    /// Final report produced
    Finalized,
}

/// fc / attention sparsity collector for OPT
pub struct OptCollector {
    base: ModuleCollector,
    config: CollectorConfig,
    fc_sparsity: SparsityCounter,
    attn_sparsity: SparsityCounter,
    num_attention_heads: Option<usize>,
    finalized: bool,
}

impl OptCollector {
    pub fn new(config: CollectorConfig) -> Self {
        let plotter = Plotter::new(config.output_dir.clone(), config.plots);
        Self {
            base: ModuleCollector::new(plotter),
            config,
            fc_sparsity: SparsityCounter::new(),
            attn_sparsity: SparsityCounter::new(),
            num_attention_heads: None,
            finalized: false,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn base(&self) -> &ModuleCollector {
        &self.base
    }

    pub fn fc_sparsity(&self) -> SparsityCounter {
        self.fc_sparsity
    }

    pub fn attn_sparsity(&self) -> SparsityCounter {
        self.attn_sparsity
    }

    pub fn num_attention_heads(&self) -> Option<usize> {
        self.num_attention_heads
    }

    pub fn state(&self) -> CollectorState {
        if self.finalized {
            CollectorState::Finalized
        } else if self.num_attention_heads.is_none() {
            CollectorState::Unconfigured
        } else if self.fc_sparsity.is_empty() && self.attn_sparsity.is_empty() {
            CollectorState::Configured
        } else {
            CollectorState::Accumulating
        }
    }

    /// Attention summary of a `[batch, seq, hidden]` tensor
    ///
    /// With `Some(n_head)` the tensor is viewed as `[batch, seq, n_head,
    /// head_dim]` and a `[batch, n_head]` grid of above-threshold counts is
    /// plotted. With `None` the tensor is summarized as is under
    /// `{name}.raw`. Either way its counts go into the attention counter.
    pub fn get_head_summary(
        &mut self,
        tensor: &Tensor,
        n_head: Option<usize>,
        name: &str,
    ) -> Result<TensorDataInfo> {
        let threshold = self.config.attn_sparsity_threshold;

        let info = match n_head {
            Some(n_head) => {
                let per_head = split_heads(tensor, n_head)?;
                let grid = per_head.count_above_by_axes(threshold, &[0, 2]);
                self.base.plt_grid(&grid, name)?;
                self.base.tensor_data_info(&per_head, name, threshold)
            }
            None => self
                .base
                .tensor_data_info(tensor, &format!("{name}.raw"), threshold),
        };

        ModuleCollector::update_sparsity_from_tensor_data_info(&mut self.attn_sparsity, &info);
        Ok(info)
    }

    /// Activation summary of an fc activation output `[tokens, features]`
    ///
    /// Plots a histogram of nonzero counts per feature column and a grid of
    /// the raw values, and adds the above-threshold count to the fc counter.
    pub fn get_fc_act_summary(
        &mut self,
        output: &ModuleOutput<'_>,
        name: &str,
    ) -> Result<TensorDataInfo> {
        let tensor = output.as_tensor().ok_or_else(|| Error::NotATensor {
            name: name.to_string(),
            found: output.kind(),
        })?;
        if tensor.shape.is_empty() {
            return Err(Error::shape(format!("`{name}` produced a scalar")));
        }

        let feature_axis = tensor.shape.len() - 1;
        let per_feature = tensor.count_nonzero_by_axes(&[feature_axis]);

        let info = self
            .base
            .tensor_data_info(tensor, name, self.config.fc_sparsity_threshold);
        self.base.plt_hist(&per_feature.data, name, &info.fmt)?;
        ModuleCollector::update_sparsity_from_tensor_data_info(&mut self.fc_sparsity, &info);

        self.base.plt_grid(tensor, name)?;
        Ok(info)
    }

    /// Hook for `name`; requires [`Collector::register_hook`] to have set the
    /// head count
    pub fn get_hook(&self, name: &str) -> Result<Hook> {
        let n_head = self.num_attention_heads.ok_or(Error::Unconfigured {
            operation: "get_hook",
        })?;
        Ok(hook_for(name, n_head))
    }

    /// Current counters as a report
    pub fn report(&self) -> Result<SparsityReport> {
        let report = SparsityReport {
            fc: self.fc_sparsity,
            attn: self.attn_sparsity,
        };
        // Surface an undefined ratio here rather than when printing
        report.lines()?;
        Ok(report)
    }
}

fn hook_for(name: &str, n_head: usize) -> Hook {
    if name.ends_with(OUT_PROJ_SUFFIX) {
        Hook::HeadSummary { n_head }
    } else if name.ends_with(ACTIVATION_SUFFIX) {
        Hook::FcActSummary
    } else {
        Hook::Record
    }
}

/// `[batch, seq, hidden]` -> `[batch, seq, n_head, hidden / n_head]`
fn split_heads(tensor: &Tensor, n_head: usize) -> Result<Tensor> {
    let split_error = || Error::HeadSplit {
        shape: tensor.shape.clone(),
        n_head,
    };
    let &[batch, seq, hidden] = tensor.shape.as_slice() else {
        return Err(split_error());
    };
    if n_head == 0 || hidden % n_head != 0 {
        return Err(split_error());
    }
    tensor.try_reshape(&[batch, seq, n_head, hidden / n_head])
}

impl ForwardObserver for OptCollector {
    fn is_hooked(&self, name: &str) -> bool {
        self.base.hooks().contains(name)
    }

    fn observe(&mut self, call: &ModuleCall<'_>) -> Result<()> {
        let Some(hook) = self.base.hooks().get(call.name) else {
            return Ok(());
        };
        self.base.record(call);

        match hook {
            Hook::Record => {}
            Hook::HeadSummary { n_head } => {
                let input = call.inputs.first().ok_or_else(|| {
                    Error::shape(format!("`{}` was called without inputs", call.name))
                })?;
                self.get_head_summary(input, Some(n_head), call.name)?;
            }
            Hook::FcActSummary => {
                self.get_fc_act_summary(&call.output, call.name)?;
            }
        }
        Ok(())
    }
}

impl Collector for OptCollector {
    fn register_hook(&mut self, model: &OptModel) -> Result<()> {
        let n_head = model.config.num_attention_heads;
        self.num_attention_heads = Some(n_head);
        self.base
            .register_hooks_with(model, |name| Ok(hook_for(name, n_head)))?;
        info!(
            heads = n_head,
            modules = self.base.hooks().len(),
            "sparsity hooks registered"
        );
        Ok(())
    }

    fn summary(&self) -> Option<SparsityReport> {
        Some(SparsityReport {
            fc: self.fc_sparsity,
            attn: self.attn_sparsity,
        })
    }

    fn finish(&mut self) -> Result<Option<SparsityReport>> {
        let report = self.report()?;
        self.finalized = true;
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OptConfig;

    fn collector() -> OptCollector {
        OptCollector::new(CollectorConfig {
            plots: false,
            ..CollectorConfig::default()
        })
    }

    fn configured() -> OptCollector {
        let mut c = collector();
        c.num_attention_heads = Some(4);
        c
    }

    #[test]
    fn test_defaults() {
        let c = collector();
        assert_eq!(c.config().fc_sparsity_threshold, 0.001);
        assert_eq!(c.config().attn_sparsity_threshold, 0.1);
        assert_eq!(c.state(), CollectorState::Unconfigured);
        assert!(c.fc_sparsity().is_empty() && c.attn_sparsity().is_empty());
    }

    #[test]
    fn test_get_hook_requires_head_count() {
        let c = collector();
        assert!(matches!(
            c.get_hook("model.decoder.layers.0.activation_fn"),
            Err(Error::Unconfigured { .. })
        ));
    }

    #[test]
    fn test_hook_selection_by_suffix() {
        let c = configured();
        assert_eq!(
            c.get_hook("model.decoder.layers.3.self_attn.out_proj").unwrap(),
            Hook::HeadSummary { n_head: 4 }
        );
        assert_eq!(
            c.get_hook("model.decoder.layers.3.activation_fn").unwrap(),
            Hook::FcActSummary
        );
        assert_eq!(
            c.get_hook("model.decoder.layers.3.self_attn.q_proj").unwrap(),
            Hook::Record
        );
        assert_eq!(c.get_hook("lm_head").unwrap(), Hook::Record);
    }

    #[test]
    fn test_fc_summary_of_zeros() {
        let mut c = configured();
        let zeros = Tensor::zeros(vec![5, 7]);
        let info = c
            .get_fc_act_summary(&ModuleOutput::Tensor(&zeros), "fc")
            .unwrap();
        assert_eq!(info.above, 0);
        assert_eq!(c.fc_sparsity(), SparsityCounter { above: 0, total: 35 });
        assert!(c.attn_sparsity().is_empty());
    }

    #[test]
    fn test_fc_summary_counts_above_threshold() {
        let mut c = configured();
        let t = Tensor::new(vec![0.0, 0.0005, 0.002, -3.0], vec![2, 2]);
        c.get_fc_act_summary(&ModuleOutput::Tensor(&t), "fc").unwrap();
        assert_eq!(c.fc_sparsity(), SparsityCounter { above: 2, total: 4 });
        assert_eq!(c.state(), CollectorState::Accumulating);
    }

    #[test]
    fn test_fc_summary_rejects_tuples() {
        let mut c = configured();
        let t = Tensor::zeros(vec![2, 2]);
        let result = c.get_fc_act_summary(&ModuleOutput::Tuple(vec![&t]), "fc");
        assert!(matches!(
            result,
            Err(Error::NotATensor { found: "tuple", .. })
        ));
        assert!(c.fc_sparsity().is_empty());
    }

    #[test]
    fn test_head_summary_raw_keeps_shape() {
        let mut c = configured();
        let t = Tensor::full(vec![2, 3, 10], 1.0);
        let info = c.get_head_summary(&t, None, "attn").unwrap();
        assert_eq!(info.shape, vec![2, 3, 10]);
        assert_eq!(info.name, "attn.raw");
        assert_eq!(c.attn_sparsity(), SparsityCounter { above: 60, total: 60 });
    }

    #[test]
    fn test_head_summary_splits_heads() {
        let mut c = configured();
        let t = Tensor::new(
            (0..24).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect(),
            vec![1, 3, 8],
        );
        let info = c.get_head_summary(&t, Some(4), "attn").unwrap();
        assert_eq!(info.shape, vec![1, 3, 4, 2]);
        assert_eq!(c.attn_sparsity(), SparsityCounter { above: 12, total: 24 });
    }

    #[test]
    fn test_head_summary_indivisible_fails() {
        let mut c = configured();
        let t = Tensor::zeros(vec![1, 2, 10]);
        assert!(matches!(
            c.get_head_summary(&t, Some(4), "attn"),
            Err(Error::HeadSplit { n_head: 4, .. })
        ));
        assert!(c.attn_sparsity().is_empty());
    }

    #[test]
    fn test_register_hook_sets_heads_only() {
        let config = OptConfig::tiny(40);
        let model = OptModel::random(&config, 7);
        let mut c = collector();
        c.register_hook(&model).unwrap();

        assert_eq!(c.num_attention_heads(), Some(config.num_attention_heads));
        assert_eq!(c.state(), CollectorState::Configured);
        assert!(c.fc_sparsity().is_empty() && c.attn_sparsity().is_empty());
        assert_eq!(c.base().hooks().len(), model.named_modules().len());
        assert_eq!(
            c.base()
                .hooks()
                .get("model.decoder.layers.1.self_attn.out_proj"),
            Some(Hook::HeadSummary { n_head: 4 })
        );
    }

    #[test]
    fn test_forward_pass_counts_both_kinds() {
        let config = OptConfig::tiny(40);
        let model = OptModel::random(&config, 8);
        let mut c = collector();
        c.register_hook(&model).unwrap();

        let ids = vec![vec![2, 5, 9, 13]];
        model.forward(&ids, &mut c).unwrap();

        let tokens = 4u64;
        let layers = config.num_hidden_layers as u64;
        assert_eq!(
            c.fc_sparsity().total,
            layers * tokens * config.ffn_dim as u64
        );
        assert_eq!(
            c.attn_sparsity().total,
            layers * tokens * config.hidden_size as u64
        );
        assert_eq!(c.base().records()["model.decoder.layers.0.activation_fn"].calls, 1);

        let report = c.finish().unwrap().unwrap();
        assert_eq!(report.fc, c.fc_sparsity());
        assert_eq!(c.state(), CollectorState::Finalized);
    }

    #[test]
    fn test_report_before_any_pass_fails() {
        let c = configured();
        assert!(matches!(c.report(), Err(Error::EmptyCounter("fc"))));
    }
}
