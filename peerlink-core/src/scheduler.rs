//! Adaptive delay for the send loop: busy queue polls tightly, idle queue backs off.

use std::time::Duration;

/// Result of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Sent,
    NoWork,
    /// An item was due but no enabled transport could take it.
    Blocked,
}

/// Delay between scheduler iterations, kept within `[min, max]`.
/// A send halves it; no work widens it by `step`.
#[derive(Debug, Clone)]
pub struct AdaptiveDelay {
    min: Duration,
    max: Duration,
    step: Duration,
    current: Duration,
}

impl AdaptiveDelay {
    pub fn new(min: Duration, max: Duration, step: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            step,
            current: min,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Feed the outcome of an iteration; returns the delay before the next one.
    pub fn update(&mut self, result: DispatchResult) -> Duration {
        self.current = match result {
            DispatchResult::Sent => (self.current / 2).max(self.min),
            DispatchResult::NoWork | DispatchResult::Blocked => {
                self.current.saturating_add(self.step).min(self.max)
            }
        };
        self.current
    }

    /// New work arrived: poll again as soon as allowed.
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
