//! Optimizer and learning-rate scheduler capabilities, plus the parameter
//! grouping and step planning the trainer performs before building them.

use nextok_core::{LrSchedulerType, ValidatedConfig};
use serde::Serialize;

/// Parameter-name fragments exempt from weight decay.
pub const NO_DECAY: [&str; 2] = ["bias", "LayerNorm.weight"];

/// An optimizer over parameter handles it received at construction.
pub trait Optimizer {
    /// Apply one update from the accumulated gradients.
    fn step(&mut self) -> anyhow::Result<()>;

    fn zero_grad(&mut self) -> anyhow::Result<()>;

    /// Multiply every gradient by `inv_scale` in place.
    ///
    /// Returns `false` when any gradient is non-finite after unscaling; the
    /// caller then skips [`Optimizer::step`] for this cycle.
    fn unscale_grads(&mut self, inv_scale: f64) -> anyhow::Result<bool>;
}

/// A learning-rate schedule advanced once per completed optimizer step.
pub trait LrScheduler {
    fn step(&mut self) -> anyhow::Result<()>;

    /// Most recent learning rate, when the implementation tracks it.
    fn last_lr(&self) -> Option<f64> {
        None
    }
}

/// Parameters sharing one weight-decay setting.
#[derive(Debug, Clone)]
pub struct ParamGroup<P> {
    pub name: &'static str,
    pub weight_decay: f64,
    pub names: Vec<String>,
    pub params: Vec<P>,
}

impl<P> ParamGroup<P> {
    fn empty(name: &'static str, weight_decay: f64) -> Self {
        Self {
            name,
            weight_decay,
            names: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

/// True when `name` contains one of the [`NO_DECAY`] fragments.
pub fn is_no_decay(name: &str) -> bool {
    NO_DECAY.iter().any(|fragment| name.contains(fragment))
}

/// Split named parameters into the `decay` group (with `weight_decay`) and
/// the `no_decay` group (with 0.0). Both groups are always returned, in that
/// order, even if one is empty.
pub fn partition_parameters<P>(
    named: impl IntoIterator<Item = (String, P)>,
    weight_decay: f64,
) -> Vec<ParamGroup<P>> {
    let mut decay = ParamGroup::empty("decay", weight_decay);
    let mut no_decay = ParamGroup::empty("no_decay", 0.0);
    for (name, param) in named {
        let group = if is_no_decay(&name) {
            &mut no_decay
        } else {
            &mut decay
        };
        group.names.push(name);
        group.params.push(param);
    }
    vec![decay, no_decay]
}

/// Inputs a scheduler factory needs to build the configured schedule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulePlan {
    pub kind: LrSchedulerType,
    pub learning_rate: f64,
    pub warmup_steps: u64,
    pub total_steps: u64,
}

impl SchedulePlan {
    /// Plan for `micro_batches_per_epoch` batches under `config`.
    ///
    /// Uses the step ceiling when set, otherwise one step per full
    /// accumulation cycle of every epoch.
    pub fn from_config(config: &ValidatedConfig, micro_batches_per_epoch: usize) -> Self {
        let natural = planned_steps(
            micro_batches_per_epoch,
            config.gradient_accumulation_steps,
            config.num_train_epochs,
        );
        Self {
            kind: config.lr_scheduler_type,
            learning_rate: config.learning_rate,
            warmup_steps: config.warmup_steps,
            total_steps: config.max_train_steps.unwrap_or(natural),
        }
    }
}

/// Optimizer steps taken by `epochs` passes over `batches` micro-batches with
/// accumulation factor `accumulation`. Partial cycles at an epoch's end do not
/// produce a step.
pub fn planned_steps(batches: usize, accumulation: usize, epochs: usize) -> u64 {
    if accumulation == 0 {
        return 0;
    }
    (epochs as u64) * (batches / accumulation) as u64
}
