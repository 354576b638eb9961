//! Exponential backoff with jitter for the notifier's reconnect loop.

use std::time::Duration;

/// Doubling backoff between a floor and a ceiling, with ±10% jitter.
///
/// The attempt counter wraps back to zero once `reset_after` attempts have
/// been consumed, so a long outage cycles through the ramp again instead of
/// sleeping at the ceiling forever.
#[derive(Debug)]
pub struct ExponentialBackoff {
    floor: Duration,
    ceiling: Duration,
    reset_after: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(floor: Duration, ceiling: Duration, reset_after: u32) -> Self {
        Self {
            floor,
            ceiling,
            reset_after: reset_after.max(1),
            attempt: 0,
        }
    }

    /// Delay for the next attempt, advancing the counter.
    pub fn next_delay(&mut self) -> Duration {
        if self.attempt >= self.reset_after {
            self.attempt = 0;
        }
        let exp = self
            .floor
            .saturating_mul(1u32 << self.attempt.min(20))
            .min(self.ceiling);
        self.attempt += 1;
        // ±10% jitter
        exp.mul_f64(0.9 + fastrand::f64() * 0.2)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts consumed since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
