//! Name-to-factory registry for model construction.
//!
//! Models are looked up by task name (`"causal_lm"`, `"embedding"`, or any
//! custom key such as `"my_models:TinyLm"`) and built from a checkpoint path.
//! There is no dynamic lookup; every task must be registered up front. Task
//! names are case-insensitive.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::error::{CollaboratorContext, Result, TrainerError};

/// Task used when none is requested.
pub const DEFAULT_TASK: &str = "embedding";

/// Builds a `T` from a checkpoint directory or model identifier.
pub type Factory<T> = Box<dyn Fn(&Path) -> anyhow::Result<T>>;

pub struct ModelRegistry<T> {
    factories: BTreeMap<String, Factory<T>>,
}

impl<T> Default for ModelRegistry<T> {
    fn default() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }
}

impl<T> fmt::Debug for ModelRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("tasks", &self.tasks())
            .finish()
    }
}

impl<T> ModelRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `task`. A task can only be registered once.
    pub fn register<F>(&mut self, task: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn(&Path) -> anyhow::Result<T> + 'static,
    {
        let task = task.into().to_lowercase();
        if self.factories.contains_key(&task) {
            return Err(TrainerError::AlreadyRegistered(task));
        }
        self.factories.insert(task, Box::new(factory));
        Ok(())
    }

    pub fn contains(&self, task: &str) -> bool {
        self.factories.contains_key(&task.to_lowercase())
    }

    /// Registered task names, lowercased and sorted.
    pub fn tasks(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the model for `task` (default [`DEFAULT_TASK`]) from `checkpoint`.
    pub fn resolve(&self, task: Option<&str>, checkpoint: &Path) -> Result<T> {
        let task = task.unwrap_or(DEFAULT_TASK);
        let factory = self
            .factories
            .get(&task.to_lowercase())
            .ok_or_else(|| TrainerError::UnknownTask(task.to_string()))?;
        tracing::info!(task, checkpoint = %checkpoint.display(), "loading model");
        factory(checkpoint).during("model construction")
    }
}

/// Resolve a model for `task` and load the tokenizer paired with the same
/// checkpoint.
pub fn load_model_and_tokenizer<M, T, F>(
    models: &ModelRegistry<M>,
    load_tokenizer: F,
    checkpoint: &Path,
    task: Option<&str>,
) -> Result<(M, T)>
where
    F: FnOnce(&Path) -> anyhow::Result<T>,
{
    let tokenizer = load_tokenizer(checkpoint).during("tokenizer load")?;
    let model = models.resolve(task, checkpoint)?;
    Ok((model, tokenizer))
}
