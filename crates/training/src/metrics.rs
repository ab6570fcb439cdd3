use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let v = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(v);
        v
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Running throughput and smoothed loss for committed steps. Rolled-back
/// iterations are counted separately and never enter the averages.
#[derive(Debug)]
pub struct TrainingMetrics {
    step_timer: Instant,
    start_time: Instant,
    examples_processed: u64,
    rollbacks: usize,
    loss_ema: ExponentialMovingAverage,
    throughput_ema: ExponentialMovingAverage,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TrainingMetrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            step_timer: now,
            start_time: now,
            examples_processed: 0,
            rollbacks: 0,
            loss_ema: ExponentialMovingAverage::new(0.1),
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record_step(&mut self, examples: u64, loss: f64, grad_norm: f64) -> StepSnapshot {
        let now = Instant::now();
        let step_duration = now.duration_since(self.step_timer);
        self.step_timer = now;

        self.examples_processed = self.examples_processed.saturating_add(examples);
        let step_examples_per_sec = if step_duration > Duration::ZERO {
            examples as f64 / step_duration.as_secs_f64()
        } else {
            0.0
        };

        StepSnapshot {
            loss: self.loss_ema.update(loss),
            step_loss: loss,
            examples_per_sec: self.throughput_ema.update(step_examples_per_sec),
            grad_norm,
            total_examples: self.examples_processed,
            rollbacks: self.rollbacks,
            wall_time: now.duration_since(self.start_time),
        }
    }

    /// Restarts the step timer so the discarded iteration does not count toward
    /// the next step's throughput.
    pub fn record_rollback(&mut self) {
        self.rollbacks += 1;
        self.step_timer = Instant::now();
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks
    }
}

#[derive(Debug, Clone)]
pub struct StepSnapshot {
    /// Smoothed loss.
    pub loss: f64,
    pub step_loss: f64,
    pub examples_per_sec: f64,
    pub grad_norm: f64,
    pub total_examples: u64,
    pub rollbacks: usize,
    pub wall_time: Duration,
}
