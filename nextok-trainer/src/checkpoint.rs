//! Checkpoint management for training runs.
//!
//! Every checkpoint is a directory `output_dir/<tag>` holding whatever the
//! model writes plus a `trainer_state.json` metadata file. Step checkpoints
//! are kept in a FIFO bounded by `save_total_limit`; `best` and `epoch-N`
//! checkpoints are never evicted.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use nextok_core::ConfigError;
use nextok_core::persistence::{read_json, write_json_atomic};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{CollaboratorContext, Result, TrainerError};
use crate::model::CausalLm;

/// Metadata file written into every checkpoint directory.
pub const METADATA_FILE: &str = "trainer_state.json";

/// Name of a checkpoint directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointTag {
    Step(u64),
    Epoch(usize),
    Best,
}

impl CheckpointTag {
    pub fn is_step(&self) -> bool {
        matches!(self, Self::Step(_))
    }
}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step(step) => write!(f, "step-{step}"),
            Self::Epoch(epoch) => write!(f, "epoch-{epoch}"),
            Self::Best => f.write_str("best"),
        }
    }
}

impl Serialize for CheckpointTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A checkpoint this manager wrote during the current run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointRecord {
    pub tag: CheckpointTag,
    pub path: PathBuf,
    /// Insertion sequence number within this manager.
    pub order: u64,
    pub saved_at: DateTime<Utc>,
}

/// Training progress stored next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub tag: String,
    pub global_step: u64,
    pub epoch: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_eval_loss: Option<f64>,
    pub seed: u64,
    pub run_id: String,
    pub saved_at: DateTime<Utc>,
}

/// Saves, evicts and tracks checkpoints under one output directory.
pub struct CheckpointManager {
    output_dir: PathBuf,
    save_total_limit: usize,
    step_records: VecDeque<CheckpointRecord>,
    epoch_records: Vec<CheckpointRecord>,
    best: Option<CheckpointRecord>,
    next_order: u64,
}

impl CheckpointManager {
    pub fn new(output_dir: impl Into<PathBuf>, save_total_limit: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            save_total_limit,
            step_records: VecDeque::new(),
            epoch_records: Vec::new(),
            best: None,
            next_order: 0,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn dir_for(&self, tag: CheckpointTag) -> PathBuf {
        self.output_dir.join(tag.to_string())
    }

    /// Persist the model under `output_dir/<tag>`, replacing any previous
    /// contents for the same tag. Failures propagate.
    ///
    /// The checkpoint is written into a `.<tag>.partial` sibling first and
    /// only swapped into place once complete, so a failed save leaves the
    /// previous checkpoint and its record untouched.
    pub fn save<M: CausalLm + ?Sized>(
        &mut self,
        model: &M,
        tag: CheckpointTag,
        metadata: &CheckpointMetadata,
    ) -> Result<CheckpointRecord> {
        let dir = self.dir_for(tag);
        let staging = self.output_dir.join(format!(".{tag}.partial"));
        let fail = |source: io::Error| TrainerError::checkpoint(tag.to_string(), source);

        remove_if_present(&staging).map_err(fail)?;
        if let Err(e) = write_staged(model, &staging, metadata) {
            if let Err(cleanup) = remove_if_present(&staging) {
                tracing::warn!(%tag, error = %cleanup, "failed to remove partial checkpoint");
            }
            return Err(fail(e));
        }

        if remove_if_present(&dir).map_err(fail)? {
            tracing::debug!(%tag, "replacing existing checkpoint");
        }
        fs::rename(&staging, &dir).map_err(fail)?;

        let record = CheckpointRecord {
            tag,
            path: dir,
            order: self.next_order,
            saved_at: metadata.saved_at,
        };
        self.next_order += 1;

        match tag {
            CheckpointTag::Step(_) => {
                self.step_records.retain(|r| r.tag != tag);
                self.step_records.push_back(record.clone());
            }
            CheckpointTag::Epoch(_) => {
                self.epoch_records.retain(|r| r.tag != tag);
                self.epoch_records.push(record.clone());
            }
            CheckpointTag::Best => self.best = Some(record.clone()),
        }

        tracing::info!(%tag, path = %record.path.display(), "saved checkpoint");
        Ok(record)
    }

    /// Evict the oldest step checkpoints until at most `save_total_limit`
    /// remain. Removal errors are logged and ignored. Returns how many records
    /// were evicted.
    pub fn prune(&mut self) -> usize {
        let mut evicted = 0;
        while self.step_records.len() > self.save_total_limit {
            let Some(oldest) = self.step_records.pop_front() else {
                break;
            };
            match fs::remove_dir_all(&oldest.path) {
                Ok(()) => tracing::debug!(tag = %oldest.tag, "evicted checkpoint"),
                Err(e) => tracing::warn!(
                    tag = %oldest.tag,
                    path = %oldest.path.display(),
                    error = %e,
                    "failed to remove old checkpoint"
                ),
            }
            evicted += 1;
        }
        evicted
    }

    /// Load weights from a checkpoint directory into `model`.
    pub fn load<M: CausalLm + ?Sized>(model: &mut M, dir: &Path) -> Result<()> {
        if !dir.is_dir() {
            return Err(ConfigError::MissingCheckpoint {
                path: dir.to_path_buf(),
            }
            .into());
        }
        model.load(dir).during("checkpoint load")
    }

    /// Metadata stored in a checkpoint directory, if any.
    pub fn read_metadata(dir: &Path) -> Result<Option<CheckpointMetadata>> {
        Ok(read_json(&dir.join(METADATA_FILE))?)
    }

    /// Step checkpoints still on disk, oldest first.
    pub fn step_records(&self) -> impl Iterator<Item = &CheckpointRecord> {
        self.step_records.iter()
    }

    pub fn epoch_records(&self) -> &[CheckpointRecord] {
        &self.epoch_records
    }

    pub fn best(&self) -> Option<&CheckpointRecord> {
        self.best.as_ref()
    }

    /// Highest step checkpoint still retained.
    pub fn latest_step(&self) -> Option<&CheckpointRecord> {
        self.step_records.back()
    }

    /// Every tracked record in save order.
    pub fn records(&self) -> Vec<&CheckpointRecord> {
        let mut all: Vec<&CheckpointRecord> = self
            .step_records
            .iter()
            .chain(self.epoch_records.iter())
            .chain(self.best.iter())
            .collect();
        all.sort_by_key(|r| r.order);
        all
    }
}

/// Remove a directory tree. Returns whether anything was there.
fn remove_if_present(dir: &Path) -> io::Result<bool> {
    match fs::remove_dir_all(dir) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn write_staged<M: CausalLm + ?Sized>(
    model: &M,
    staging: &Path,
    metadata: &CheckpointMetadata,
) -> io::Result<()> {
    fs::create_dir_all(staging)?;
    model.save(staging).map_err(io::Error::other)?;
    write_json_atomic(&staging.join(METADATA_FILE), metadata)
}
