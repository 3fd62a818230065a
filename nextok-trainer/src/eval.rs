//! No-gradient evaluation over a held-out set.

use std::ops::{Deref, DerefMut};

use nextok_core::{ConfigError, PrecisionMode};
use serde::Serialize;

use crate::data::DataLoader;
use crate::error::{CollaboratorContext, Result, TrainerError};
use crate::model::{CausalLm, LossTensor};
use crate::precision::AutocastScope;

/// Mean loss of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EvalReport {
    pub mean_loss: f64,
    pub batches: usize,
}

impl EvalReport {
    /// `exp(mean_loss)`. Informational; may overflow to infinity.
    pub fn perplexity(&self) -> f64 {
        self.mean_loss.exp()
    }
}

/// Puts a model in evaluation mode with gradients disabled, and restores
/// training mode with gradients enabled when dropped.
pub struct EvalModeGuard<'a, M: CausalLm + ?Sized> {
    model: &'a mut M,
}

impl<'a, M: CausalLm + ?Sized> EvalModeGuard<'a, M> {
    pub fn enter(model: &'a mut M) -> Self {
        model.eval();
        model.set_grad_enabled(false);
        Self { model }
    }
}

impl<M: CausalLm + ?Sized> Deref for EvalModeGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        self.model
    }
}

impl<M: CausalLm + ?Sized> DerefMut for EvalModeGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.model
    }
}

impl<M: CausalLm + ?Sized> Drop for EvalModeGuard<'_, M> {
    fn drop(&mut self) {
        self.model.set_grad_enabled(true);
        self.model.train();
    }
}

/// Evaluation pass over a fixed, non-empty loader.
pub struct EvaluationLoop<E> {
    loader: E,
}

impl<E: DataLoader> EvaluationLoop<E> {
    /// Rejects an empty loader up front so averaging can never divide by zero.
    pub fn new(loader: E) -> Result<Self> {
        if loader.is_empty() {
            return Err(ConfigError::EmptyEvalSet.into());
        }
        Ok(Self { loader })
    }

    pub fn len(&self) -> usize {
        self.loader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loader.is_empty()
    }

    /// Mean per-batch loss over the whole set.
    ///
    /// The model is back in training mode when this returns, whether it
    /// succeeded or not.
    pub fn run<M>(&mut self, model: &mut M, precision: PrecisionMode) -> Result<EvalReport>
    where
        M: CausalLm<Batch = E::Batch> + ?Sized,
    {
        let mut guard = EvalModeGuard::enter(model);
        let mut total = 0.0_f64;
        let mut batches = 0_usize;

        for batch in self.loader.batches() {
            let batch = batch?;
            let mut scope = AutocastScope::enter(&mut *guard, precision);
            let output = scope.forward(&batch).during("evaluation forward pass")?;
            total += output.loss.item();
            batches += 1;
        }

        if batches == 0 {
            return Err(TrainerError::data("evaluation loader yielded no batches"));
        }

        let report = EvalReport {
            mean_loss: total / batches as f64,
            batches,
        };
        tracing::debug!(batches, mean_loss = report.mean_loss, "evaluation pass done");
        Ok(report)
    }
}
