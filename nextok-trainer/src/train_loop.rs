//! The training loop orchestrator.
//!
//! A [`TrainLoop`] is built once by [`TrainLoop::init`], which validates the
//! configuration and wires up every collaborator, and then driven to
//! completion by a single call to [`TrainLoop::run`]:
//!
//! ```text
//! Init ──run()──▶ Running ──(epochs exhausted | max_train_steps)──▶ Completed
//! ```
//!
//! Collaborator failures abort the run and propagate to the caller. A loop
//! that failed mid-run stays `Running` and cannot be restarted.

use std::fmt;
use std::fs;
use std::time::Instant;

use chrono::{DateTime, Utc};
use nextok_core::persistence::write_atomic;
use nextok_core::{ConfigError, TrainConfig, ValidatedConfig};
use uuid::Uuid;

use crate::callbacks::{LoggingCallback, TrainEvent, TrainerCallback};
use crate::checkpoint::{CheckpointManager, CheckpointMetadata, CheckpointRecord, CheckpointTag};
use crate::data::DataLoader;
use crate::error::{CollaboratorContext, Result, TrainerError};
use crate::eval::EvaluationLoop;
use crate::metrics::{RunSummary, TrainingMetrics};
use crate::model::{CausalLm, LossTensor};
use crate::optim::{LrScheduler, Optimizer, ParamGroup, SchedulePlan, partition_parameters};
use crate::precision::{AutocastScope, Precision, StepOutcome};
use crate::seed::{RngStreams, seed_all};
use crate::state::{AccumulationCycle, TrainingState};

/// Configuration snapshot written to the output directory at init.
pub const CONFIG_SNAPSHOT: &str = "train_config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Init,
    Running,
    Completed,
}

impl LoopPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Running => "running",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives epochs, accumulation cycles, evaluation and checkpointing for one
/// model.
pub struct TrainLoop<M, L, E, O, S>
where
    M: CausalLm,
{
    train_loader: L,
    core: LoopCore<M, E, O, S>,
    phase: LoopPhase,
}

/// Everything the loop mutates while the training loader is being iterated.
struct LoopCore<M: CausalLm, E, O, S> {
    config: ValidatedConfig,
    model: M,
    evaluator: Option<EvaluationLoop<E>>,
    optimizer: O,
    scheduler: S,
    precision: Precision,
    cycle: AccumulationCycle,
    state: TrainingState,
    metrics: TrainingMetrics,
    checkpoints: CheckpointManager,
    callbacks: Vec<Box<dyn TrainerCallback>>,
    streams: RngStreams,
    run_id: Uuid,
}

impl<M, L, E, O, S> TrainLoop<M, L, E, O, S>
where
    M: CausalLm,
    L: DataLoader<Batch = M::Batch>,
    E: DataLoader<Batch = M::Batch>,
    O: Optimizer,
    S: LrScheduler,
{
    /// Validate `config` and prepare every collaborator.
    ///
    /// Nothing touches the filesystem or the random state until the
    /// configuration, the evaluation set and the resume path have been
    /// checked. The optimizer factory receives the decay and no-decay
    /// parameter groups plus the learning rate; the scheduler factory receives
    /// the planned schedule.
    pub fn init<OF, SF>(
        config: TrainConfig,
        mut model: M,
        mut train_loader: L,
        eval_loader: Option<E>,
        optimizer_factory: OF,
        scheduler_factory: SF,
    ) -> Result<Self>
    where
        OF: FnOnce(Vec<ParamGroup<M::Param>>, f64) -> anyhow::Result<O>,
        SF: FnOnce(&SchedulePlan) -> anyhow::Result<S>,
    {
        let config = config.validate()?;
        let evaluator = eval_loader.map(EvaluationLoop::new).transpose()?;
        if let Some(path) = &config.resume_from_checkpoint
            && !path.is_dir()
        {
            return Err(ConfigError::MissingCheckpoint { path: path.clone() }.into());
        }

        let streams = seed_all(config.seed, &mut model, &mut train_loader);

        fs::create_dir_all(&config.output_dir)?;
        write_atomic(
            &config.output_dir.join(CONFIG_SNAPSHOT),
            config.to_toml()?.as_bytes(),
        )?;

        if let Some(path) = &config.resume_from_checkpoint {
            CheckpointManager::load(&mut model, path)?;
            tracing::info!(path = %path.display(), "resumed model weights");
        }
        model.to(config.device).during("device transfer")?;

        let precision = Precision::new(config.precision());

        let groups = partition_parameters(model.named_parameters(), config.weight_decay);
        for group in &groups {
            tracing::debug!(
                group = group.name,
                params = group.len(),
                weight_decay = group.weight_decay,
                "parameter group"
            );
        }
        let optimizer =
            optimizer_factory(groups, config.learning_rate).during("optimizer construction")?;

        let plan = SchedulePlan::from_config(&config, train_loader.len());
        let scheduler = scheduler_factory(&plan).during("scheduler construction")?;

        if config.use_lora {
            tracing::warn!("adapter-based fine-tuning (LoRA) is not implemented yet, training all parameters");
        }
        if train_loader.is_empty() {
            tracing::warn!("training loader is empty, no optimizer steps will be taken");
        }

        let run_id = Uuid::new_v4();
        tracing::info!(
            %run_id,
            output_dir = %config.output_dir.display(),
            device = %config.device,
            precision = %config.precision(),
            total_steps = plan.total_steps,
            "training loop initialised"
        );

        let checkpoints = CheckpointManager::new(config.output_dir.clone(), config.save_total_limit);
        Ok(Self {
            train_loader,
            core: LoopCore {
                cycle: AccumulationCycle::new(config.gradient_accumulation_steps),
                config,
                model,
                evaluator,
                optimizer,
                scheduler,
                precision,
                state: TrainingState::new(),
                metrics: TrainingMetrics::default(),
                checkpoints,
                callbacks: vec![Box::new(LoggingCallback)],
                streams,
                run_id,
            },
            phase: LoopPhase::Init,
        })
    }

    /// Add an event sink. The tracing sink is always installed first.
    pub fn with_callback(mut self, callback: impl TrainerCallback + 'static) -> Self {
        self.core.callbacks.push(Box::new(callback));
        self
    }

    /// Train until the epochs are exhausted or `max_train_steps` is reached.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.phase != LoopPhase::Init {
            return Err(TrainerError::InvalidPhase {
                expected: LoopPhase::Init.as_str(),
                actual: self.phase.as_str(),
            });
        }
        self.phase = LoopPhase::Running;

        let started = Instant::now();
        let started_at = Utc::now();
        let core = &mut self.core;
        let train_loader = &mut self.train_loader;

        core.model.train();
        tracing::info!(
            epochs = core.config.num_train_epochs,
            micro_batches_per_epoch = train_loader.len(),
            accumulation = core.cycle.factor(),
            "starting training"
        );

        for epoch in 1..=core.config.num_train_epochs {
            let mut micro_batches = 0_usize;
            let mut ceiling_reached = false;

            for batch in train_loader.batches() {
                let batch = batch?;
                micro_batches += 1;
                let loss = core.micro_batch(&batch)?;
                if !core.cycle.completes(micro_batches) {
                    continue;
                }
                core.optimizer_step()?;
                core.after_step(epoch, loss)?;
                if core.state.reached(core.config.max_train_steps) {
                    ceiling_reached = true;
                    break;
                }
            }

            core.end_epoch(epoch, micro_batches)?;
            if ceiling_reached {
                tracing::info!(
                    global_step = core.state.global_step,
                    epoch,
                    "reached max_train_steps"
                );
                break;
            }
        }

        let elapsed_secs = started.elapsed().as_secs_f64();
        let summary = core.summary(started_at, elapsed_secs);
        summary.write(&core.config.output_dir)?;
        tracing::info!(
            "Training completed in {elapsed_secs:.2} sec on {}",
            core.config.device
        );
        core.emit(TrainEvent::Completed {
            step: core.state.global_step,
            elapsed_secs,
        });

        self.phase = LoopPhase::Completed;
        Ok(summary)
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn state(&self) -> &TrainingState {
        &self.core.state
    }

    pub fn metrics(&self) -> &TrainingMetrics {
        &self.core.metrics
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.core.config
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.core.checkpoints
    }

    /// Streams derived from the run seed at init.
    pub fn rng_streams(&self) -> &RngStreams {
        &self.core.streams
    }

    pub fn run_id(&self) -> Uuid {
        self.core.run_id
    }

    pub fn precision(&self) -> &Precision {
        &self.core.precision
    }

    pub fn model(&self) -> &M {
        &self.core.model
    }

    pub fn optimizer(&self) -> &O {
        &self.core.optimizer
    }

    pub fn scheduler(&self) -> &S {
        &self.core.scheduler
    }

    pub fn into_model(self) -> M {
        self.core.model
    }
}

impl<M, E, O, S> LoopCore<M, E, O, S>
where
    M: CausalLm,
    E: DataLoader<Batch = M::Batch>,
    O: Optimizer,
    S: LrScheduler,
{
    /// Forward and backward one micro-batch. Returns the unscaled loss.
    fn micro_batch(&mut self, batch: &M::Batch) -> Result<f64> {
        let mut scope = AutocastScope::enter(&mut self.model, self.precision.mode());
        let output = scope.forward(batch).during("forward pass")?;
        let loss = output.loss.item();
        let scaled = self
            .precision
            .scale_loss(output.loss.scaled(self.cycle.loss_factor()));
        scope.backward(&scaled).during("backward pass")?;
        Ok(loss)
    }

    /// Apply the accumulated gradients and advance the counters.
    fn optimizer_step(&mut self) -> Result<u64> {
        if self.precision.step(&mut self.optimizer)? == StepOutcome::SkippedOverflow {
            self.metrics.record_skipped_step();
        }
        self.scheduler.step().during("scheduler step")?;
        self.optimizer.zero_grad().during("zero grad")?;
        Ok(self.state.advance())
    }

    /// Logging, evaluation and step checkpointing, in that order.
    fn after_step(&mut self, epoch: usize, loss: f64) -> Result<()> {
        let step = self.state.global_step;
        self.metrics.record_loss(step, epoch, loss);

        if self.state.on_cadence(self.config.logging_steps) {
            self.emit(TrainEvent::Log {
                step,
                epoch,
                loss,
                learning_rate: self.scheduler.last_lr(),
            });
        }
        if self.evaluator.is_some() && self.state.on_cadence(self.config.eval_steps) {
            self.evaluate(epoch)?;
        }
        if self.state.on_cadence(self.config.save_steps) {
            self.save(CheckpointTag::Step(step), epoch)?;
        }
        Ok(())
    }

    /// Drop any incomplete cycle, then evaluate and save the epoch checkpoint.
    fn end_epoch(&mut self, epoch: usize, micro_batches: usize) -> Result<()> {
        let discarded = self.cycle.remainder(micro_batches);
        if discarded > 0 {
            self.optimizer.zero_grad().during("zero grad")?;
        }
        self.metrics.record_epoch(discarded);

        self.evaluate(epoch)?;
        self.save(CheckpointTag::Epoch(epoch), epoch)?;
        self.emit(TrainEvent::EpochEnd {
            epoch,
            step: self.state.global_step,
            discarded_micro_batches: discarded,
        });
        Ok(())
    }

    /// Run the evaluation set, if any, and save `best` on strict improvement.
    fn evaluate(&mut self, epoch: usize) -> Result<()> {
        let Some(evaluator) = self.evaluator.as_mut() else {
            return Ok(());
        };
        let report = evaluator.run(&mut self.model, self.precision.mode())?;
        let step = self.state.global_step;
        let improved = self.state.record_eval(report.mean_loss);
        self.metrics.record_eval(step, epoch, report.mean_loss, improved);
        self.emit(TrainEvent::Evaluate {
            step,
            epoch,
            report,
            improved,
        });
        if improved {
            self.save(CheckpointTag::Best, epoch)?;
        }
        Ok(())
    }

    fn save(&mut self, tag: CheckpointTag, epoch: usize) -> Result<CheckpointRecord> {
        let metadata = CheckpointMetadata {
            tag: tag.to_string(),
            global_step: self.state.global_step,
            epoch,
            best_eval_loss: self.state.best_eval_loss(),
            seed: self.config.seed,
            run_id: self.run_id.to_string(),
            saved_at: Utc::now(),
        };
        let record = self.checkpoints.save(&self.model, tag, &metadata)?;
        self.emit(TrainEvent::Save {
            record: record.clone(),
        });
        if tag.is_step() {
            self.checkpoints.prune();
        }
        Ok(record)
    }

    fn emit(&mut self, event: TrainEvent) {
        for callback in &mut self.callbacks {
            callback.on_event(&event);
        }
    }

    fn summary(&self, started_at: DateTime<Utc>, elapsed_secs: f64) -> RunSummary {
        RunSummary {
            run_id: self.run_id.to_string(),
            global_step: self.state.global_step,
            epochs_completed: self.metrics.epochs_completed,
            best_eval_loss: self.state.best_eval_loss(),
            precision: self.precision.mode(),
            device: self.config.device,
            started_at,
            finished_at: Utc::now(),
            elapsed_secs,
            metrics: self.metrics.clone(),
        }
    }
}
