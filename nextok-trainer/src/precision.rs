//! Mixed-precision stepping.
//!
//! A [`Precision`] strategy is chosen once from the configured
//! [`PrecisionMode`]. fp32 and bf16 step the optimizer directly; fp16 wraps
//! backward and step in a dynamic [`LossScaler`]. Forward/backward pairs run
//! inside an [`AutocastScope`], which resets the model's autocast state when
//! dropped, including on early return.

use std::ops::{Deref, DerefMut};

use nextok_core::PrecisionMode;

use crate::error::{CollaboratorContext, Result};
use crate::model::{CausalLm, HalfPrecision, LossTensor};
use crate::optim::Optimizer;

/// Dynamic loss scaling for fp16 training.
#[derive(Debug, Clone, PartialEq)]
pub struct LossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: u32,
    finite_streak: u32,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            finite_streak: 0,
        }
    }
}

impl LossScaler {
    pub fn with_initial_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_growth_interval(mut self, interval: u32) -> Self {
        self.growth_interval = interval.max(1);
        self
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Adjust the scale after a step attempt.
    pub fn update(&mut self, grads_finite: bool) {
        if grads_finite {
            self.finite_streak += 1;
            if self.finite_streak >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.finite_streak = 0;
            }
        } else {
            self.scale *= self.backoff_factor;
            self.finite_streak = 0;
        }
    }
}

/// What happened when the optimizer was asked to step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// fp16 found non-finite gradients; parameters were left untouched.
    SkippedOverflow,
}

/// Precision strategy for one run.
#[derive(Debug, Clone, PartialEq)]
pub enum Precision {
    Fp32,
    Bf16,
    Fp16(LossScaler),
}

impl Precision {
    pub fn new(mode: PrecisionMode) -> Self {
        match mode {
            PrecisionMode::Fp32 => Self::Fp32,
            PrecisionMode::Bf16 => Self::Bf16,
            PrecisionMode::Fp16 => Self::Fp16(LossScaler::default()),
        }
    }

    pub fn mode(&self) -> PrecisionMode {
        match self {
            Self::Fp32 => PrecisionMode::Fp32,
            Self::Bf16 => PrecisionMode::Bf16,
            Self::Fp16(_) => PrecisionMode::Fp16,
        }
    }

    /// Multiply the loss by the current scale before backward. Identity
    /// outside fp16.
    pub fn scale_loss<L: LossTensor>(&self, loss: L) -> L {
        match self {
            Self::Fp16(scaler) => loss.scaled(scaler.scale()),
            Self::Fp32 | Self::Bf16 => loss,
        }
    }

    /// Unscale (fp16), step the optimizer unless gradients overflowed, and
    /// update the scale.
    pub fn step<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) -> Result<StepOutcome> {
        match self {
            Self::Fp32 | Self::Bf16 => {
                optimizer.step().during("optimizer step")?;
                Ok(StepOutcome::Applied)
            }
            Self::Fp16(scaler) => {
                let finite = optimizer
                    .unscale_grads(1.0 / scaler.scale())
                    .during("gradient unscale")?;
                let outcome = if finite {
                    optimizer.step().during("optimizer step")?;
                    StepOutcome::Applied
                } else {
                    tracing::warn!(
                        scale = scaler.scale(),
                        "non-finite gradients, skipping optimizer step"
                    );
                    StepOutcome::SkippedOverflow
                };
                scaler.update(finite);
                Ok(outcome)
            }
        }
    }
}

/// Autocast dtype for a precision mode; `None` for full precision.
pub fn autocast_dtype(mode: PrecisionMode) -> Option<HalfPrecision> {
    match mode {
        PrecisionMode::Fp32 => None,
        PrecisionMode::Fp16 => Some(HalfPrecision::F16),
        PrecisionMode::Bf16 => Some(HalfPrecision::Bf16),
    }
}

/// Model borrowed for the duration of one autocast region.
pub struct AutocastScope<'a, M: CausalLm + ?Sized> {
    model: &'a mut M,
}

impl<'a, M: CausalLm + ?Sized> AutocastScope<'a, M> {
    pub fn enter(model: &'a mut M, mode: PrecisionMode) -> Self {
        model.set_autocast(autocast_dtype(mode));
        Self { model }
    }
}

impl<M: CausalLm + ?Sized> Deref for AutocastScope<'_, M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        self.model
    }
}

impl<M: CausalLm + ?Sized> DerefMut for AutocastScope<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.model
    }
}

impl<M: CausalLm + ?Sized> Drop for AutocastScope<'_, M> {
    fn drop(&mut self) {
        self.model.set_autocast(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingOptimizer {
        steps: usize,
        unscaled_with: Vec<f64>,
        overflow: bool,
    }

    impl Optimizer for CountingOptimizer {
        fn step(&mut self) -> anyhow::Result<()> {
            self.steps += 1;
            Ok(())
        }

        fn zero_grad(&mut self) -> anyhow::Result<()> {
            Ok(())
        }

        fn unscale_grads(&mut self, inv_scale: f64) -> anyhow::Result<bool> {
            self.unscaled_with.push(inv_scale);
            Ok(!self.overflow)
        }
    }

    #[test]
    fn test_full_precision_steps_directly() {
        for mode in [PrecisionMode::Fp32, PrecisionMode::Bf16] {
            let mut precision = Precision::new(mode);
            let mut opt = CountingOptimizer::default();
            assert_eq!(precision.step(&mut opt).unwrap(), StepOutcome::Applied);
            assert_eq!(opt.steps, 1);
            assert!(opt.unscaled_with.is_empty());
            assert_eq!(precision.scale_loss(3.0_f64), 3.0);
        }
    }

    #[test]
    fn test_fp16_scales_and_unscales() {
        let mut precision = Precision::Fp16(LossScaler::default().with_initial_scale(8.0));
        assert_eq!(precision.scale_loss(0.5_f64), 4.0);

        let mut opt = CountingOptimizer::default();
        assert_eq!(precision.step(&mut opt).unwrap(), StepOutcome::Applied);
        assert_eq!(opt.unscaled_with, vec![0.125]);
        assert_eq!(opt.steps, 1);
    }

    #[test]
    fn test_fp16_overflow_skips_step_and_backs_off() {
        let mut precision = Precision::Fp16(LossScaler::default().with_initial_scale(1024.0));
        let mut opt = CountingOptimizer {
            overflow: true,
            ..Default::default()
        };
        assert_eq!(
            precision.step(&mut opt).unwrap(),
            StepOutcome::SkippedOverflow
        );
        assert_eq!(opt.steps, 0);
        match precision {
            Precision::Fp16(scaler) => assert_eq!(scaler.scale(), 512.0),
            other => panic!("unexpected strategy {other:?}"),
        }
    }

    #[test]
    fn test_scaler_grows_after_interval() {
        let mut scaler = LossScaler::default()
            .with_initial_scale(4.0)
            .with_growth_interval(3);
        scaler.update(true);
        scaler.update(true);
        assert_eq!(scaler.scale(), 4.0);
        scaler.update(true);
        assert_eq!(scaler.scale(), 8.0);
        scaler.update(false);
        assert_eq!(scaler.scale(), 4.0);
    }

    #[test]
    fn test_autocast_dtype() {
        assert_eq!(autocast_dtype(PrecisionMode::Fp32), None);
        assert_eq!(autocast_dtype(PrecisionMode::Fp16), Some(HalfPrecision::F16));
        assert_eq!(autocast_dtype(PrecisionMode::Bf16), Some(HalfPrecision::Bf16));
    }
}
