//! # nextok-trainer: next-token fine-tuning loop for causal language models
//!
//! The crate orchestrates training; it never computes tensors itself. Models,
//! optimizers, schedulers and data loaders are supplied through traits:
//!
//! 1. **Model**: [`CausalLm`] forward/backward, mode switches, persistence
//! 2. **Optimization**: [`Optimizer`] and [`LrScheduler`], built from
//!    weight-decay [`ParamGroup`]s and a [`SchedulePlan`]
//! 3. **Data**: [`DataLoader`] yielding pre-collated batches
//!
//! [`TrainLoop`] ties them together: gradient accumulation, mixed precision,
//! periodic evaluation, best-model tracking and bounded checkpoint retention.

pub mod callbacks;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod eval;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod precision;
pub mod registry;
pub mod seed;
pub mod state;
pub mod train_loop;

// Re-exports
pub use callbacks::{EventRecorder, LoggingCallback, TrainEvent, TrainerCallback};
pub use checkpoint::{CheckpointManager, CheckpointMetadata, CheckpointRecord, CheckpointTag};
pub use data::{DataLoader, InMemoryLoader};
pub use error::{Result, TrainerError};
pub use eval::{EvalModeGuard, EvalReport, EvaluationLoop};
pub use metrics::{RunSummary, TrainingMetrics};
pub use model::{CausalLm, HalfPrecision, LossTensor, ModelOutput, Tokenizer};
pub use optim::{LrScheduler, Optimizer, ParamGroup, SchedulePlan};
pub use precision::{AutocastScope, LossScaler, Precision, StepOutcome};
pub use registry::{ModelRegistry, load_model_and_tokenizer};
pub use seed::{RngStreams, Stream, seed_all};
pub use state::{AccumulationCycle, TrainingState};
pub use train_loop::{LoopPhase, TrainLoop};

pub use nextok_core::{
    ConfigError, Device, LrSchedulerType, PrecisionMode, TrainConfig, ValidatedConfig,
};
