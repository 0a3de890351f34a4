//! Retry strategies applied by the dispatcher.

use std::fmt;
use std::time::Duration;

/// Decides whether and when a request may be retried.
///
/// The dispatcher consults the strategy after every failed attempt; the
/// returned delay is always clamped to the request deadline.
pub trait RetryStrategy: Send + Sync + fmt::Debug {
    /// Returns the delay before the given attempt (1-based), or `None` to
    /// give up immediately.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Exponential backoff bounded by a ceiling; retries until the deadline.
#[derive(Debug, Clone)]
pub struct BestEffortRetryStrategy {
    initial: Duration,
    cap: Duration,
}

impl BestEffortRetryStrategy {
    /// Creates a strategy with explicit bounds.
    pub fn new(initial: Duration, cap: Duration) -> Self {
        Self { initial, cap }
    }
}

impl Default for BestEffortRetryStrategy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            cap: Duration::from_millis(500),
        }
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let exp = self
            .initial
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(16)));
        Some(std::cmp::min(exp, self.cap))
    }
}

/// Never retries; every failure is surfaced immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailFastRetryStrategy;

impl RetryStrategy for FailFastRetryStrategy {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        None
    }
}
