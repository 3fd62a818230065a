//! Model and tokenizer capabilities consumed by the trainer.
//!
//! The trainer never touches tensors directly. Whatever backs a model (a
//! native tensor library, an FFI binding, a test double) is driven purely
//! through these traits. Implementations report failures with `anyhow`.

use std::path::Path;

use nextok_core::Device;

/// Reduced-precision format selected for autocast regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfPrecision {
    F16,
    Bf16,
}

/// Scalar loss produced by a forward pass.
pub trait LossTensor: Sized {
    /// Host-side value of the loss.
    fn item(&self) -> f64;

    /// The loss multiplied by `factor`, still attached to the autograd graph.
    fn scaled(&self, factor: f64) -> Self;
}

impl LossTensor for f64 {
    fn item(&self) -> f64 {
        *self
    }

    fn scaled(&self, factor: f64) -> Self {
        self * factor
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput<P, L> {
    pub logits: P,
    pub loss: L,
}

/// A causal language model that can be trained, evaluated and persisted.
pub trait CausalLm {
    /// Pre-collated batch (typically field name -> tensor).
    type Batch;
    /// Predictions returned alongside the loss.
    type Logits;
    type Loss: LossTensor;
    /// Shared handle to a trainable parameter, handed to the optimizer.
    type Param: Clone;

    fn forward(&mut self, batch: &Self::Batch) -> anyhow::Result<ModelOutput<Self::Logits, Self::Loss>>;

    /// Accumulate gradients of `loss` into the parameters.
    fn backward(&mut self, loss: &Self::Loss) -> anyhow::Result<()>;

    fn named_parameters(&self) -> Vec<(String, Self::Param)>;

    fn train(&mut self);

    fn eval(&mut self);

    fn is_training(&self) -> bool;

    fn set_grad_enabled(&mut self, enabled: bool);

    /// Enter (`Some`) or leave (`None`) an autocast region.
    fn set_autocast(&mut self, precision: Option<HalfPrecision>);

    /// Seed every generator the model owns (initialisation, dropout, device RNGs).
    fn manual_seed(&mut self, seed: u64);

    fn save(&self, dir: &Path) -> anyhow::Result<()>;

    fn load(&mut self, dir: &Path) -> anyhow::Result<()>;

    fn to(&mut self, device: Device) -> anyhow::Result<()>;
}

impl<M: CausalLm + ?Sized> CausalLm for Box<M> {
    type Batch = M::Batch;
    type Logits = M::Logits;
    type Loss = M::Loss;
    type Param = M::Param;

    fn forward(&mut self, batch: &Self::Batch) -> anyhow::Result<ModelOutput<Self::Logits, Self::Loss>> {
        (**self).forward(batch)
    }

    fn backward(&mut self, loss: &Self::Loss) -> anyhow::Result<()> {
        (**self).backward(loss)
    }

    fn named_parameters(&self) -> Vec<(String, Self::Param)> {
        (**self).named_parameters()
    }

    fn train(&mut self) {
        (**self).train()
    }

    fn eval(&mut self) {
        (**self).eval()
    }

    fn is_training(&self) -> bool {
        (**self).is_training()
    }

    fn set_grad_enabled(&mut self, enabled: bool) {
        (**self).set_grad_enabled(enabled)
    }

    fn set_autocast(&mut self, precision: Option<HalfPrecision>) {
        (**self).set_autocast(precision)
    }

    fn manual_seed(&mut self, seed: u64) {
        (**self).manual_seed(seed)
    }

    fn save(&self, dir: &Path) -> anyhow::Result<()> {
        (**self).save(dir)
    }

    fn load(&mut self, dir: &Path) -> anyhow::Result<()> {
        (**self).load(dir)
    }

    fn to(&mut self, device: Device) -> anyhow::Result<()> {
        (**self).to(device)
    }
}

/// Text tokenizer paired with a model checkpoint.
pub trait Tokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>>;

    fn pad_token_id(&self) -> Option<u32>;

    fn eos_token_id(&self) -> Option<u32>;

    /// Padding id for causal LMs, falling back to end-of-sequence when the
    /// vocabulary has no dedicated pad token.
    fn effective_pad_token_id(&self) -> Option<u32> {
        self.pad_token_id().or_else(|| self.eos_token_id())
    }
}
