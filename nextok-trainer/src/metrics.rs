//! Run history and the persisted run summary.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nextok_core::persistence::{read_json, write_json_atomic};
use nextok_core::{Device, PrecisionMode};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Summary file written to the output directory when a run completes.
pub const SUMMARY_FILE: &str = "run_summary.json";

/// One measurement taken at an optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepValue {
    pub step: u64,
    pub epoch: usize,
    pub value: f64,
}

/// Losses and milestones accumulated over a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub loss_history: Vec<StepValue>,
    pub eval_history: Vec<StepValue>,
    pub best_step: Option<u64>,
    pub epochs_completed: usize,
    /// Optimizer steps skipped because fp16 gradients overflowed.
    pub skipped_steps: u64,
    pub discarded_micro_batches: usize,
}

impl TrainingMetrics {
    pub fn record_loss(&mut self, step: u64, epoch: usize, loss: f64) {
        self.loss_history.push(StepValue {
            step,
            epoch,
            value: loss,
        });
    }

    pub fn record_eval(&mut self, step: u64, epoch: usize, loss: f64, improved: bool) {
        self.eval_history.push(StepValue {
            step,
            epoch,
            value: loss,
        });
        if improved {
            self.best_step = Some(step);
        }
    }

    pub fn record_epoch(&mut self, discarded_micro_batches: usize) {
        self.epochs_completed += 1;
        self.discarded_micro_batches += discarded_micro_batches;
    }

    pub fn record_skipped_step(&mut self) {
        self.skipped_steps += 1;
    }

    pub fn last_loss(&self) -> Option<f64> {
        self.loss_history.last().map(|v| v.value)
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub global_step: u64,
    pub epochs_completed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_eval_loss: Option<f64>,
    pub precision: PrecisionMode,
    pub device: Device,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub metrics: TrainingMetrics,
}

impl RunSummary {
    /// Write `run_summary.json` into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(SUMMARY_FILE);
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    pub fn read(dir: &Path) -> Result<Option<Self>> {
        Ok(read_json(&dir.join(SUMMARY_FILE))?)
    }
}
