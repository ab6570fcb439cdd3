use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RollbackReason {
    NonFinite { loss: f64 },
    Spike { loss: f64, window_mean: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GuardVerdict {
    Commit,
    Rollback(RollbackReason),
}

/// Loss-spike detector over a sliding window of recent step losses.
///
/// Once the window is full, a loss larger than `threshold` times the mean of the
/// other `window - 1` entries is a spike. Non-finite losses are rejected
/// regardless of how full the window is. Any rejection empties the window.
#[derive(Debug, Clone)]
pub struct StabilityGuard {
    window: usize,
    threshold: f64,
    recent: VecDeque<f64>,
}

impl StabilityGuard {
    pub fn new(window: usize, threshold: f64) -> Self {
        let window = window.max(2);
        Self {
            window,
            threshold,
            recent: VecDeque::with_capacity(window),
        }
    }

    pub fn observe(&mut self, loss: f64) -> GuardVerdict {
        if !loss.is_finite() {
            self.recent.clear();
            return GuardVerdict::Rollback(RollbackReason::NonFinite { loss });
        }

        self.recent.push_back(loss);
        if self.recent.len() > self.window {
            self.recent.pop_front();
        }
        if self.recent.len() < self.window {
            return GuardVerdict::Commit;
        }

        let previous = self.recent.iter().take(self.window - 1).sum::<f64>();
        let window_mean = previous / (self.window - 1) as f64;
        if loss > self.threshold * window_mean {
            self.recent.clear();
            return GuardVerdict::Rollback(RollbackReason::Spike { loss, window_mean });
        }
        GuardVerdict::Commit
    }

    pub fn clear(&mut self) {
        self.recent.clear();
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}
