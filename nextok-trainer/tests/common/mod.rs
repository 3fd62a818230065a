//! Toy collaborators shared by the integration tests.
//!
//! `ToyModel` is a one-feature linear model `loss = weight * mean(batch) + bias`
//! with an extra `LayerNorm.weight` parameter. Parameters are shared with the
//! optimizer through `Rc<RefCell<_>>` handles.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use nextok_trainer::{
    CausalLm, Device, HalfPrecision, InMemoryLoader, LossTensor, LrScheduler, ModelOutput,
    Optimizer, ParamGroup, SchedulePlan, TrainConfig, TrainEvent, TrainLoop,
};

/// Shared event log plus a callback that appends to it.
pub fn recorder() -> (Rc<RefCell<Vec<TrainEvent>>>, impl FnMut(&TrainEvent)) {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    (events, move |e: &TrainEvent| sink.borrow_mut().push(e.clone()))
}

#[derive(Debug, Default)]
pub struct ToyParam {
    pub value: f64,
    pub grad: f64,
}

pub type Param = Rc<RefCell<ToyParam>>;

fn param(value: f64) -> Param {
    Rc::new(RefCell::new(ToyParam { value, grad: 0.0 }))
}

/// Loss value plus the factor backward will multiply gradients by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ToyLoss {
    pub value: f64,
    pub grad_factor: f64,
}

impl LossTensor for ToyLoss {
    fn item(&self) -> f64 {
        self.value
    }

    fn scaled(&self, factor: f64) -> Self {
        Self {
            value: self.value * factor,
            grad_factor: self.grad_factor * factor,
        }
    }
}

pub struct ToyModel {
    pub weight: Param,
    pub bias: Param,
    pub norm: Param,
    pub training: bool,
    pub grad_enabled: bool,
    pub autocast: Option<HalfPrecision>,
    pub train_autocast_seen: Vec<Option<HalfPrecision>>,
    /// Gradient factors seen by backward, in call order.
    pub backward_factors: Vec<f64>,
    /// Losses reported by evaluation forwards, consumed front first.
    pub eval_losses: VecDeque<f64>,
    pub seed: Option<u64>,
    pub device: Option<Device>,
    last_input: f64,
}

impl ToyModel {
    pub fn new(weight: f64, bias: f64) -> Self {
        Self {
            weight: param(weight),
            bias: param(bias),
            norm: param(1.0),
            training: false,
            grad_enabled: true,
            autocast: None,
            train_autocast_seen: Vec::new(),
            backward_factors: Vec::new(),
            eval_losses: VecDeque::new(),
            seed: None,
            device: None,
            last_input: 0.0,
        }
    }

    pub fn with_eval_losses(mut self, losses: impl IntoIterator<Item = f64>) -> Self {
        self.eval_losses = losses.into_iter().collect();
        self
    }

    /// Deterministic prediction for input `x`.
    pub fn predict(&self, x: f64) -> f64 {
        self.weight.borrow().value * x + self.bias.borrow().value
    }
}

impl CausalLm for ToyModel {
    type Batch = Vec<f64>;
    type Logits = f64;
    type Loss = ToyLoss;
    type Param = Param;

    fn forward(&mut self, batch: &Vec<f64>) -> anyhow::Result<ModelOutput<f64, ToyLoss>> {
        anyhow::ensure!(!batch.is_empty(), "empty batch");
        let x = batch.iter().sum::<f64>() / batch.len() as f64;
        let prediction = self.predict(x);
        self.last_input = x;

        let value = if self.training {
            self.train_autocast_seen.push(self.autocast);
            prediction
        } else {
            self.eval_losses.pop_front().unwrap_or(prediction)
        };
        Ok(ModelOutput {
            logits: prediction,
            loss: ToyLoss {
                value,
                grad_factor: 1.0,
            },
        })
    }

    fn backward(&mut self, loss: &ToyLoss) -> anyhow::Result<()> {
        anyhow::ensure!(self.grad_enabled, "backward with gradients disabled");
        self.backward_factors.push(loss.grad_factor);
        self.weight.borrow_mut().grad += loss.grad_factor * self.last_input;
        self.bias.borrow_mut().grad += loss.grad_factor;
        Ok(())
    }

    fn named_parameters(&self) -> Vec<(String, Param)> {
        vec![
            ("decoder.weight".into(), self.weight.clone()),
            ("decoder.bias".into(), self.bias.clone()),
            ("decoder.LayerNorm.weight".into(), self.norm.clone()),
        ]
    }

    fn train(&mut self) {
        self.training = true;
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_grad_enabled(&mut self, enabled: bool) {
        self.grad_enabled = enabled;
    }

    fn set_autocast(&mut self, precision: Option<HalfPrecision>) {
        self.autocast = precision;
    }

    fn manual_seed(&mut self, seed: u64) {
        self.seed = Some(seed);
    }

    fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let weights: BTreeMap<String, f64> = self
            .named_parameters()
            .into_iter()
            .map(|(name, p)| (name, p.borrow().value))
            .collect();
        fs::write(dir.join("model.json"), serde_json::to_vec(&weights)?)?;
        Ok(())
    }

    fn load(&mut self, dir: &Path) -> anyhow::Result<()> {
        let weights: BTreeMap<String, f64> =
            serde_json::from_slice(&fs::read(dir.join("model.json"))?)?;
        for (name, p) in self.named_parameters() {
            let value = weights
                .get(&name)
                .ok_or_else(|| anyhow::anyhow!("missing parameter {name}"))?;
            p.borrow_mut().value = *value;
        }
        Ok(())
    }

    fn to(&mut self, device: Device) -> anyhow::Result<()> {
        self.device = Some(device);
        Ok(())
    }
}

/// Plain SGD with decoupled weight decay per group.
pub struct ToyOptimizer {
    pub groups: Vec<ParamGroup<Param>>,
    pub learning_rate: f64,
    pub steps: usize,
    pub zero_grads: usize,
    pub unscales: Vec<f64>,
}

impl ToyOptimizer {
    pub fn new(groups: Vec<ParamGroup<Param>>, learning_rate: f64) -> Self {
        Self {
            groups,
            learning_rate,
            steps: 0,
            zero_grads: 0,
            unscales: Vec::new(),
        }
    }

    pub fn group(&self, name: &str) -> &ParamGroup<Param> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .expect("group exists")
    }

    fn params(&self) -> impl Iterator<Item = (&Param, f64)> {
        self.groups
            .iter()
            .flat_map(|g| g.params.iter().map(move |p| (p, g.weight_decay)))
    }
}

impl Optimizer for ToyOptimizer {
    fn step(&mut self) -> anyhow::Result<()> {
        for (p, weight_decay) in self.params() {
            let mut p = p.borrow_mut();
            let update = p.grad + weight_decay * p.value;
            p.value -= self.learning_rate * update;
        }
        self.steps += 1;
        Ok(())
    }

    fn zero_grad(&mut self) -> anyhow::Result<()> {
        for (p, _) in self.params() {
            p.borrow_mut().grad = 0.0;
        }
        self.zero_grads += 1;
        Ok(())
    }

    fn unscale_grads(&mut self, inv_scale: f64) -> anyhow::Result<bool> {
        self.unscales.push(inv_scale);
        let mut finite = true;
        for (p, _) in self.params() {
            let mut p = p.borrow_mut();
            p.grad *= inv_scale;
            finite &= p.grad.is_finite();
        }
        Ok(finite)
    }
}

/// Linear decay to zero over the planned steps.
pub struct ToyScheduler {
    pub plan: SchedulePlan,
    pub steps: u64,
}

impl LrScheduler for ToyScheduler {
    fn step(&mut self) -> anyhow::Result<()> {
        self.steps += 1;
        Ok(())
    }

    fn last_lr(&self) -> Option<f64> {
        let total = self.plan.total_steps.max(1) as f64;
        let remaining = (self.plan.total_steps.saturating_sub(self.steps)) as f64;
        Some(self.plan.learning_rate * remaining / total)
    }
}

pub type ToyLoop = TrainLoop<ToyModel, InMemoryLoader<f64>, InMemoryLoader<f64>, ToyOptimizer, ToyScheduler>;

/// Frequent logging, no periodic eval or step saves unless a test asks.
pub fn config(output_dir: &Path) -> TrainConfig {
    let mut config = TrainConfig::new(output_dir);
    config.batch_size = 1;
    config.num_train_epochs = 1;
    config.learning_rate = 0.1;
    config.logging_steps = 1;
    config.eval_steps = 1_000;
    config.save_steps = 1_000;
    config
}

pub fn examples(n: usize) -> Vec<f64> {
    (1..=n).map(|i| i as f64).collect()
}

pub fn build(
    config: TrainConfig,
    model: ToyModel,
    train: Vec<f64>,
    eval: Option<Vec<f64>>,
) -> nextok_trainer::Result<ToyLoop> {
    let batch_size = config.batch_size;
    TrainLoop::init(
        config,
        model,
        InMemoryLoader::new(train, batch_size),
        eval.map(|e| InMemoryLoader::new(e, batch_size)),
        |groups, lr| Ok(ToyOptimizer::new(groups, lr)),
        |plan: &SchedulePlan| {
            Ok(ToyScheduler {
                plan: plan.clone(),
                steps: 0,
            })
        },
    )
}

/// Names of `step-*` directories under `dir`, sorted.
pub fn step_dirs(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("step-"))
        .collect();
    names.sort();
    names
}
