//! Exponential backoff schedule for reconnect attempts

use std::time::Duration;

use crate::config::RetrySettings;

/// Produces the delay before each reconnect attempt: base * factor^n,
/// capped. The schedule is consumed once per reconnect sequence and reset
/// when a connection is reestablished.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    base: Duration,
    factor: f64,
    cap: Duration,
    ceiling: u32,
    attempt: u32,
}

impl BackoffSchedule {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            base: Duration::from_secs(settings.backoff_base_secs),
            factor: settings.backoff_factor,
            cap: Duration::from_secs(settings.backoff_cap_secs),
            ceiling: settings.ceiling,
            attempt: 0,
        }
    }

    /// Attempts consumed so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once the ceiling is
    /// exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.ceiling {
            return None;
        }

        let scaled = self.base.as_secs_f64() * self.factor.powi(self.attempt as i32);
        self.attempt += 1;

        let delay = Duration::from_secs_f64(scaled);
        Some(delay.min(self.cap))
    }

    /// Reset after a successful connection
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
