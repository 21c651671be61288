use std::time::Duration;

use crate::types::HttpMethod;

/// Capped exponential backoff, used by reconnect loops.
///
/// The realtime channel task waits `delay_for_attempt(n)` after its `n`th
/// consecutive failed connection and resets `n` once a join succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000)
    }
}

/// Bounded linear backoff: attempt `n` is followed by a wait of `delay * n`.
///
/// `max_attempts` counts every attempt, including the first one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearBackoff {
    max_attempts: u32,
    delay: Duration,
}

impl LinearBackoff {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the failed attempt number `attempt` (1-based), or
    /// `None` when the budget is spent.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.delay.saturating_mul(attempt.max(1)))
    }
}

/// Number of attempts a single request may use. Only idempotent methods are
/// retried so that side effects are never duplicated.
pub fn attempts_for_method(method: HttpMethod) -> u32 {
    if method.is_idempotent() { 2 } else { 1 }
}
