//! # nextok-core: shared configuration, errors, logging and persistence
//!
//! Everything here is independent of the training loop itself so that the
//! configuration surface can be loaded, validated and logged before any
//! model or data collaborator exists.

pub mod config;
pub mod error;
pub mod logging;
pub mod persistence;

pub use config::{
    Device, LrSchedulerType, PrecisionMode, TrainConfig, ValidatedConfig, load_config,
};
pub use error::ConfigError;
pub use logging::{LogOptions, init_logging};
