//! Error types for the nextok-trainer crate.

use nextok_core::ConfigError;
use thiserror::Error;

/// Result alias used throughout the trainer.
pub type Result<T> = std::result::Result<T, TrainerError>;

/// Top-level error type for training runs.
#[derive(Debug, Error)]
pub enum TrainerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A model, optimizer, scheduler or data collaborator failed.
    #[error("{operation} failed: {source:#}")]
    Collaborator {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Checkpoint '{tag}' could not be written: {source}")]
    Checkpoint {
        tag: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Data error: {0}")]
    Data(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Already registered: {0}")]
    AlreadyRegistered(String),

    #[error("Training loop is {actual}, expected {expected}")]
    InvalidPhase {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TrainerError {
    pub fn collaborator(operation: &'static str, source: anyhow::Error) -> Self {
        Self::Collaborator { operation, source }
    }

    pub fn checkpoint(tag: impl Into<String>, source: std::io::Error) -> Self {
        Self::Checkpoint {
            tag: tag.into(),
            source,
        }
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }
}

/// Attach the failed operation to a collaborator's `anyhow` error.
pub(crate) trait CollaboratorContext<T> {
    fn during(self, operation: &'static str) -> Result<T>;
}

impl<T> CollaboratorContext<T> for anyhow::Result<T> {
    fn during(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| TrainerError::collaborator(operation, source))
    }
}
