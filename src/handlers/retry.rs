//! Message re-queue policy

use crate::core::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Computes re-queue delays for messages that cannot make progress yet.
///
/// Task-level backoff (a task returning RUNNING) is separate and uses the
/// task's own declared period.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    attempts_ceiling: u32,
}

// attempt-based scaling is bounded so delays stay sane for long-lived
// re-queue loops
const MAX_FACTOR: u32 = 10;

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            attempts_ceiling: config.attempts_ceiling,
        }
    }

    /// Delay before the given redelivery attempt, with ±10% jitter.
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = attempts.clamp(1, MAX_FACTOR);
        let scaled = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        scaled.mul_f64(jitter)
    }

    /// Whether this many attempts exhausts the message.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts > self.attempts_ceiling
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
