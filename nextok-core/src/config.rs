//! Training configuration.
//!
//! Uses `figment` for layered loading: defaults -> user config -> explicit file ->
//! environment -> explicit overrides. A loaded [`TrainConfig`] is validated once
//! into a [`ValidatedConfig`], which is read-only for the rest of the run.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::ConfigError;

/// Numeric format used for forward/backward compute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl fmt::Display for PrecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Fp32 => "fp32",
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
        };
        f.write_str(name)
    }
}

/// Learning-rate schedule family. The formulas live with the scheduler
/// implementation; the controller only forwards the choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    #[default]
    Linear,
    Cosine,
    CosineWithRestarts,
    Polynomial,
    Constant,
    ConstantWithWarmup,
}

/// Compute device the model is moved to at initialisation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}

impl FromStr for Device {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse().ok())
                .map(Self::Cuda)
                .ok_or_else(|| ConfigError::invalid("device", format!("unknown device '{s}'"))),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(device: Device) -> Self {
        device.to_string()
    }
}

/// Hyperparameters recognised by the training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Root directory for checkpoints and run artifacts. Required.
    pub output_dir: PathBuf,
    /// Token budget per example, consumed by the data pipeline.
    pub max_seq_length: usize,
    /// Examples per micro-batch.
    pub batch_size: usize,
    /// Micro-batches summed before one optimizer step.
    pub gradient_accumulation_steps: usize,
    pub num_train_epochs: usize,
    pub learning_rate: f64,
    /// Decay applied to every parameter outside the no-decay set.
    pub weight_decay: f64,
    pub lr_scheduler_type: LrSchedulerType,
    pub warmup_steps: u64,
    pub logging_steps: u64,
    pub eval_steps: u64,
    pub save_steps: u64,
    /// Upper bound on retained `step-N` checkpoints.
    pub save_total_limit: usize,
    pub fp16: bool,
    pub bf16: bool,
    /// Hard ceiling on optimizer steps across all epochs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_train_steps: Option<u64>,
    pub seed: u64,
    /// Checkpoint directory whose weights are loaded before training.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_from_checkpoint: Option<PathBuf>,
    pub dataloader_num_workers: usize,
    pub device: Device,
    /// Adapter-based fine-tuning. Accepted but not implemented.
    pub use_lora: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::new(),
            max_seq_length: 2048,
            batch_size: 8,
            gradient_accumulation_steps: 1,
            num_train_epochs: 3,
            learning_rate: 1e-4,
            weight_decay: 0.01,
            lr_scheduler_type: LrSchedulerType::Linear,
            warmup_steps: 0,
            logging_steps: 50,
            eval_steps: 200,
            save_steps: 500,
            save_total_limit: 3,
            fp16: false,
            bf16: false,
            max_train_steps: None,
            seed: 42,
            resume_from_checkpoint: None,
            dataloader_num_workers: 4,
            device: Device::Cpu,
            use_lora: false,
        }
    }
}

impl TrainConfig {
    /// A default configuration writing into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Self::default()
        }
    }

    /// Resolve the precision flags into a single mode.
    pub fn precision(&self) -> Result<PrecisionMode, ConfigError> {
        match (self.fp16, self.bf16) {
            (true, true) => Err(ConfigError::ConflictingPrecision),
            (true, false) => Ok(PrecisionMode::Fp16),
            (false, true) => Ok(PrecisionMode::Bf16),
            (false, false) => Ok(PrecisionMode::Fp32),
        }
    }

    /// Check every option and freeze the configuration.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        let precision = self.precision()?;

        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingOutputDir);
        }

        let positive: [(&'static str, u64); 7] = [
            ("max_seq_length", self.max_seq_length as u64),
            ("batch_size", self.batch_size as u64),
            (
                "gradient_accumulation_steps",
                self.gradient_accumulation_steps as u64,
            ),
            ("num_train_epochs", self.num_train_epochs as u64),
            ("logging_steps", self.logging_steps),
            ("eval_steps", self.eval_steps),
            ("save_steps", self.save_steps),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::invalid(field, "must be at least 1"));
        }

        if self.max_train_steps == Some(0) {
            return Err(ConfigError::invalid(
                "max_train_steps",
                "must be at least 1 when set",
            ));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(ConfigError::invalid(
                "learning_rate",
                format!("must be a positive finite number, got {}", self.learning_rate),
            ));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(ConfigError::invalid(
                "weight_decay",
                format!("must be a non-negative finite number, got {}", self.weight_decay),
            ));
        }

        Ok(ValidatedConfig {
            inner: self,
            precision,
        })
    }

    /// Render as TOML, e.g. for a snapshot stored next to the checkpoints.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// A configuration that passed [`TrainConfig::validate`]. Read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedConfig {
    inner: TrainConfig,
    precision: PrecisionMode,
}

impl ValidatedConfig {
    pub fn precision(&self) -> PrecisionMode {
        self.precision
    }

    pub fn into_inner(self) -> TrainConfig {
        self.inner
    }
}

impl Deref for ValidatedConfig {
    type Target = TrainConfig;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// Load a training configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `NEXTOK_`, e.g. `NEXTOK_SAVE_STEPS`)
/// 3. The explicit config file, when given
/// 4. User config (`<config dir>/nextok/config.toml`)
/// 5. Built-in defaults
///
/// The result is not validated; call [`TrainConfig::validate`] before use.
pub fn load_config(
    file: Option<&Path>,
    overrides: Option<&TrainConfig>,
) -> Result<TrainConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TrainConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "nextok", "nextok") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(file) = file {
        figment = figment.merge(Toml::file(file));
    }

    figment = figment.merge(Env::prefixed("NEXTOK_"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
}
