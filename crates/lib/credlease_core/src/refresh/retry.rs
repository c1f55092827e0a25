//! Injectable retry policy for transient refresh failures.
//!
//! Exponential backoff (`base * 2^(n-1)`, capped at `max_delay`) plus a
//! jitter drawn from a pluggable [`JitterSource`], so the delay schedule can
//! be checked without real timers or randomness.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Produces the random part of a backoff delay.
pub trait JitterSource: Send + Sync {
    /// A duration in `0..=ceiling`.
    fn jitter(&self, ceiling: Duration) -> Duration;
}

/// Uniform jitter from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn jitter(&self, ceiling: Duration) -> Duration {
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=ceiling_ms))
    }
}

/// Always zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl JitterSource for NoJitter {
    fn jitter(&self, _ceiling: Duration) -> Duration {
        Duration::ZERO
    }
}

/// Max attempts, base delay, delay cap and jitter ceiling.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ceiling: Duration,
    jitter: Arc<dyn JitterSource>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter_ceiling: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter_ceiling,
            jitter: Arc::new(RandomJitter),
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    /// Replace the jitter source.
    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn should_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let backoff = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        backoff + self.jitter.jitter(self.jitter_ceiling)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            4,
            Duration::from_millis(250),
            Duration::from_secs(10),
            Duration::from_millis(250),
        )
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter_ceiling", &self.jitter_ceiling)
            .finish_non_exhaustive()
    }
}
