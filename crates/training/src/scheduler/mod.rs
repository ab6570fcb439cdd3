use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::{config, TrainingError};

pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
    fn snapshot(&self) -> SchedulerState;
    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError>;
}

/// Serialized scheduler position, stored next to the optimizer state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub kind: String,
    pub step: usize,
    pub current_lr: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Decay {
    Constant,
    Cosine { min_lr: f64 },
    Polynomial { min_lr: f64, power: f64 },
}

impl Decay {
    fn kind(self) -> &'static str {
        match self {
            Decay::Constant => "constant",
            Decay::Cosine { .. } => "cosine_with_warmup",
            Decay::Polynomial { .. } => "polynomial",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    base_lr: f64,
    total_steps: usize,
    warmup_fraction: f64,
    decay: Decay,
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        total_steps: usize,
    ) -> Result<Self, TrainingError> {
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if cfg.min_lr < 0.0 || cfg.min_lr > base_lr {
            return Err(TrainingError::initialization(
                "scheduler min_lr must be in [0, base_lr]",
            ));
        }

        let decay = match cfg.strategy {
            config::LearningRateSchedule::Constant => Decay::Constant,
            config::LearningRateSchedule::CosineWithWarmup => Decay::Cosine { min_lr: cfg.min_lr },
            config::LearningRateSchedule::Polynomial => Decay::Polynomial {
                min_lr: cfg.min_lr,
                power: if cfg.power <= 0.0 { 1.0 } else { cfg.power },
            },
        };

        Ok(Self {
            base_lr,
            total_steps,
            warmup_fraction: cfg.warmup_fraction,
            decay,
        })
    }

    pub fn build(self) -> Box<dyn LRScheduler> {
        Box::new(WarmupSchedule {
            base_lr: self.base_lr,
            total_steps: self.total_steps,
            warmup_steps: compute_warmup_steps(self.total_steps, self.warmup_fraction),
            decay: self.decay,
            step: 0,
            current_lr: 0.0,
        })
    }
}

/// Linear warmup over the first `warmup_steps`, then the configured decay until
/// `total_steps`.
struct WarmupSchedule {
    base_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    decay: Decay,
    step: usize,
    current_lr: f64,
}

impl WarmupSchedule {
    fn compute_lr(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            let progress = (step + 1) as f64 / self.warmup_steps as f64;
            return self.base_lr * progress;
        }

        let progress = if self.total_steps <= self.warmup_steps {
            1.0
        } else {
            let effective = step.saturating_sub(self.warmup_steps) as f64;
            let denom = (self.total_steps - self.warmup_steps).max(1) as f64;
            (effective / denom).clamp(0.0, 1.0)
        };

        match self.decay {
            Decay::Constant => self.base_lr,
            Decay::Cosine { min_lr } => {
                let cosine = 0.5 * (1.0 + f64::cos(PI * progress));
                min_lr + (self.base_lr - min_lr) * cosine
            }
            Decay::Polynomial { min_lr, power } => {
                let decay = (1.0 - progress).max(0.0).powf(power);
                min_lr + (self.base_lr - min_lr) * decay
            }
        }
    }
}

impl LRScheduler for WarmupSchedule {
    fn step(&mut self) -> f64 {
        let lr = self.compute_lr(self.step);
        self.current_lr = lr;
        self.step = self.step.saturating_add(1);
        lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }

    fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            kind: self.decay.kind().to_string(),
            step: self.step,
            current_lr: self.current_lr,
        }
    }

    fn load_snapshot(&mut self, state: &SchedulerState) -> Result<(), TrainingError> {
        if state.kind != self.decay.kind() {
            return Err(TrainingError::runtime(format!(
                "scheduler state is for '{}' but this run uses '{}'",
                state.kind,
                self.decay.kind()
            )));
        }
        self.step = state.step;
        self.current_lr = state.current_lr;
        Ok(())
    }
}

fn compute_warmup_steps(total_steps: usize, proportion: f64) -> usize {
    if total_steps == 0 {
        return 0;
    }
    let clamped = proportion.clamp(0.0, 1.0);
    let steps = (clamped * total_steps as f64).round() as usize;
    steps.min(total_steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LearningRateSchedule;

    fn scheduler(strategy: LearningRateSchedule, min_lr: f64) -> Box<dyn LRScheduler> {
        let cfg = config::SchedulerConfig {
            enabled: true,
            strategy,
            warmup_fraction: 0.2,
            min_lr,
            power: 2.0,
        };
        SchedulerConfig::from_training_config(&cfg, 1.0, 10)
            .unwrap()
            .build()
    }

    #[test]
    fn cosine_warms_up_then_decays_to_the_floor() {
        let mut schedule = scheduler(LearningRateSchedule::CosineWithWarmup, 0.1);
        let lrs: Vec<f64> = (0..11).map(|_| schedule.step()).collect();
        assert!((lrs[0] - 0.5).abs() < 1e-12);
        assert!((lrs[1] - 1.0).abs() < 1e-12);
        assert!((lrs[2] - 1.0).abs() < 1e-12);
        assert!((lrs[6] - 0.55).abs() < 1e-12);
        assert!((lrs[10] - 0.1).abs() < 1e-12);
        assert!(lrs[2..].windows(2).all(|pair| pair[1] <= pair[0]));
    }

    #[test]
    fn polynomial_and_constant_shapes() {
        let mut poly = scheduler(LearningRateSchedule::Polynomial, 0.0);
        let lrs: Vec<f64> = (0..7).map(|_| poly.step()).collect();
        // Halfway through decay with power 2 leaves a quarter of the rate.
        assert!((lrs[6] - 0.25).abs() < 1e-12);

        let mut constant = scheduler(LearningRateSchedule::Constant, 0.0);
        constant.step();
        for _ in 0..20 {
            assert_eq!(constant.step(), 1.0);
        }
    }

    #[test]
    fn snapshot_resumes_mid_schedule() {
        let mut original = scheduler(LearningRateSchedule::CosineWithWarmup, 0.0);
        for _ in 0..4 {
            original.step();
        }
        let snapshot = original.snapshot();
        assert_eq!(snapshot.step, 4);

        let mut resumed = scheduler(LearningRateSchedule::CosineWithWarmup, 0.0);
        resumed.load_snapshot(&snapshot).unwrap();
        assert_eq!(resumed.learning_rate(), original.learning_rate());
        assert_eq!(resumed.step(), original.step());

        let mut other = scheduler(LearningRateSchedule::Polynomial, 0.0);
        assert!(other.load_snapshot(&snapshot).is_err());
    }

    #[test]
    fn rejects_floor_above_base_rate() {
        let cfg = config::SchedulerConfig {
            min_lr: 2.0,
            ..config::SchedulerConfig::default()
        };
        assert!(SchedulerConfig::from_training_config(&cfg, 1.0, 10).is_err());
    }
}
