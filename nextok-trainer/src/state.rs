//! Training counters and step-boundary logic.

/// Counters owned by the training loop.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    /// Completed optimizer steps.
    pub global_step: u64,
    /// Lowest evaluation loss seen so far; `+inf` until the first evaluation.
    pub best_eval_loss: f64,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            global_step: 0,
            best_eval_loss: f64::INFINITY,
        }
    }
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed accumulation cycle.
    pub fn advance(&mut self) -> u64 {
        self.global_step += 1;
        self.global_step
    }

    /// Record an evaluation loss. Returns `true` only on strict improvement,
    /// in which case the best loss is updated. NaN never improves.
    pub fn record_eval(&mut self, loss: f64) -> bool {
        if loss < self.best_eval_loss {
            self.best_eval_loss = loss;
            true
        } else {
            false
        }
    }

    /// Best loss, or `None` before any finite evaluation.
    pub fn best_eval_loss(&self) -> Option<f64> {
        self.best_eval_loss.is_finite().then_some(self.best_eval_loss)
    }

    /// Whether `global_step` sits on a multiple of `every` (and is past zero).
    pub fn on_cadence(&self, every: u64) -> bool {
        every > 0 && self.global_step > 0 && self.global_step % every == 0
    }

    /// Whether the optional step ceiling has been reached.
    pub fn reached(&self, ceiling: Option<u64>) -> bool {
        ceiling.is_some_and(|max| self.global_step >= max)
    }
}

/// Gradient accumulation over `factor` micro-batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccumulationCycle {
    factor: usize,
}

impl AccumulationCycle {
    pub fn new(factor: usize) -> Self {
        Self {
            factor: factor.max(1),
        }
    }

    pub fn factor(&self) -> usize {
        self.factor
    }

    /// Multiplier applied to each micro-batch loss before backward.
    pub fn loss_factor(&self) -> f64 {
        1.0 / self.factor as f64
    }

    /// Whether the 1-based micro-batch index (counted from epoch start) closes
    /// a cycle.
    pub fn completes(&self, micro_batch: usize) -> bool {
        micro_batch > 0 && micro_batch % self.factor == 0
    }

    /// Micro-batches left dangling after `micro_batches` in one epoch.
    pub fn remainder(&self, micro_batches: usize) -> usize {
        micro_batches % self.factor
    }
}
