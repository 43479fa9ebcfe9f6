//! Sliding-window throttle for failed login attempts.
//!
//! Logins are refused while `max_failures` failures fall inside the
//! rolling window; older failures age out on their own.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Timestamps of recent failed logins.
#[derive(Debug)]
pub struct FailureLog {
    /// Failures tolerated within the window.
    max_failures: u32,
    /// Duration of the sliding window.
    window: Duration,
    /// Oldest first; never longer than `max_failures`.
    failures: VecDeque<Instant>,
}

impl FailureLog {
    /// * `max_failures` - Failures tolerated within the window.
    /// * `window_secs` - Window duration in seconds.
    pub fn new(max_failures: u32, window_secs: u64) -> Self {
        Self {
            max_failures,
            window: Duration::from_secs(window_secs),
            failures: VecDeque::new(),
        }
    }

    /// Whether login attempts are currently refused.
    pub fn is_locked(&self) -> bool {
        self.is_locked_at(Instant::now())
    }

    pub fn is_locked_at(&self, now: Instant) -> bool {
        if self.max_failures == 0 {
            return false;
        }
        let active = self
            .failures
            .iter()
            .filter(|t| now.saturating_duration_since(**t) < self.window)
            .count();
        active as u32 >= self.max_failures
    }

    /// Record a failed attempt.
    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&mut self, at: Instant) {
        self.failures.push_back(at);
        while self.failures.len() > self.max_failures as usize {
            self.failures.pop_front();
        }
    }

    /// Failures currently remembered.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
