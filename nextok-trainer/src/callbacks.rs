//! Progress events emitted by the training loop.

use serde::Serialize;

use crate::checkpoint::CheckpointRecord;
use crate::eval::EvalReport;

/// Something observable happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrainEvent {
    /// Periodic training-loss report.
    Log {
        step: u64,
        epoch: usize,
        loss: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        learning_rate: Option<f64>,
    },
    Evaluate {
        step: u64,
        epoch: usize,
        report: EvalReport,
        /// The evaluation set a new best loss.
        improved: bool,
    },
    Save { record: CheckpointRecord },
    EpochEnd {
        epoch: usize,
        step: u64,
        /// Micro-batches dropped because they did not complete a cycle.
        discarded_micro_batches: usize,
    },
    Completed {
        step: u64,
        elapsed_secs: f64,
    },
}

/// Receives every [`TrainEvent`] in emission order.
pub trait TrainerCallback {
    fn on_event(&mut self, event: &TrainEvent);
}

impl<F: FnMut(&TrainEvent)> TrainerCallback for F {
    fn on_event(&mut self, event: &TrainEvent) {
        self(event)
    }
}

/// Forwards events to `tracing`. Installed on every loop.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallback;

impl TrainerCallback for LoggingCallback {
    fn on_event(&mut self, event: &TrainEvent) {
        match event {
            TrainEvent::Log {
                step,
                epoch,
                loss,
                learning_rate,
            } => tracing::info!(step, epoch, loss, learning_rate = ?learning_rate, "train"),
            TrainEvent::Evaluate {
                step,
                epoch,
                report,
                improved,
            } => tracing::info!(
                step,
                epoch,
                eval_loss = report.mean_loss,
                perplexity = report.perplexity(),
                improved,
                "eval"
            ),
            TrainEvent::Save { record } => {
                tracing::debug!(tag = %record.tag, path = %record.path.display(), "checkpoint saved")
            }
            TrainEvent::EpochEnd {
                epoch,
                step,
                discarded_micro_batches,
            } => {
                if *discarded_micro_batches > 0 {
                    tracing::debug!(
                        epoch,
                        discarded = discarded_micro_batches,
                        "dropped incomplete accumulation cycle"
                    );
                }
                tracing::info!(epoch, step, "epoch finished");
            }
            TrainEvent::Completed { step, elapsed_secs } => {
                tracing::info!(step, elapsed_secs, "run completed")
            }
        }
    }
}

/// Keeps a copy of every event, in order.
#[derive(Debug, Default, Clone)]
pub struct EventRecorder {
    pub events: Vec<TrainEvent>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps at which a `Log` event was emitted.
    pub fn logged_steps(&self) -> Vec<u64> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TrainEvent::Log { step, .. } => Some(*step),
                _ => None,
            })
            .collect()
    }

    /// Names of saved checkpoints in save order.
    pub fn saved_tags(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TrainEvent::Save { record } => Some(record.tag.to_string()),
                _ => None,
            })
            .collect()
    }
}

impl TrainerCallback for EventRecorder {
    fn on_event(&mut self, event: &TrainEvent) {
        self.events.push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointTag;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn save_event(tag: CheckpointTag) -> TrainEvent {
        TrainEvent::Save {
            record: CheckpointRecord {
                tag,
                path: PathBuf::from("/tmp/run").join(tag.to_string()),
                order: 0,
                saved_at: Utc::now(),
            },
        }
    }

    #[test]
    fn test_recorder_keeps_order() {
        let mut recorder = EventRecorder::new();
        recorder.on_event(&TrainEvent::Log {
            step: 2,
            epoch: 1,
            loss: 0.9,
            learning_rate: None,
        });
        recorder.on_event(&save_event(CheckpointTag::Step(2)));
        recorder.on_event(&save_event(CheckpointTag::Best));

        assert_eq!(recorder.logged_steps(), vec![2]);
        assert_eq!(recorder.saved_tags(), vec!["step-2", "best"]);
    }

    #[test]
    fn test_closure_callback() {
        let mut count = 0;
        {
            let mut cb = |_: &TrainEvent| count += 1;
            cb.on_event(&TrainEvent::Completed {
                step: 1,
                elapsed_secs: 0.1,
            });
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(TrainEvent::EpochEnd {
            epoch: 1,
            step: 4,
            discarded_micro_batches: 0,
        })
        .unwrap();
        assert_eq!(json["event"], "epoch_end");
        assert_eq!(json["step"], 4);
    }
}
