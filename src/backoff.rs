//! Bounded exponential backoff for store outages, per step and per applied result.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with a cap on both delay and attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    max_retries: u32,
    retries: u32,
}

impl RetryBackoff {
    /// Creates a backoff starting at `initial`, capping at `max`, allowing `max_retries` retries.
    pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
            max_retries,
            retries: 0,
        }
    }

    /// Returns the delay before the next retry.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Retries consumed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Consumes one retry. Returns the delay to wait, or `None` once retries are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.max_retries {
            return None;
        }
        let delay = self.current;
        self.retries += 1;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }

    /// Resets after a success.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.retries = 0;
    }
}
