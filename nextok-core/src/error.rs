//! Error types for configuration handling.
//!
//! Every variant here is fatal at initialisation: a run never starts with a
//! configuration that produced one of these.

use std::path::PathBuf;

/// Errors detected while loading or validating a training configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("fp16 and bf16 are mutually exclusive; enable at most one")]
    ConflictingPrecision,

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("output_dir is required")]
    MissingOutputDir,

    #[error("evaluation set is empty")]
    EmptyEvalSet,

    #[error("resume checkpoint not found at {}", path.display())]
    MissingCheckpoint { path: PathBuf },

    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
