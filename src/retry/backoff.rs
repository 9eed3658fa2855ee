//! Backoff policies
//!
//! A backoff answers "how long before attempt `n + 1`?" after attempt `n`
//! failed, or `None` to stop. The answer depends only on its inputs so tests
//! can assert exact schedules.

use std::time::Duration;

use tonic::Status;

pub trait BackoffStrategy<T: ?Sized>: Send + Sync + 'static {
    /// `attempt` is the 1-based number of the attempt that just failed.
    fn next_delay(&self, status: &Status, target: &T, attempt: u32) -> Option<Duration>;
}

/// Same delay every time, up to an optional attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    pub delay: Duration,
    /// Total attempts allowed including the first; `None` never gives up.
    pub max_attempts: Option<u32>,
}

impl FixedDelay {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: Some(max_attempts),
        }
    }

    pub fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
        }
    }
}

impl<T: ?Sized> BackoffStrategy<T> for FixedDelay {
    fn next_delay(&self, _status: &Status, _target: &T, attempt: u32) -> Option<Duration> {
        if exhausted(self.max_attempts, attempt) {
            return None;
        }
        Some(self.delay)
    }
}

/// `initial * factor^(attempt - 1)`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, factor: f64, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            factor,
            max_delay,
            max_attempts: Some(max_attempts),
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.max(1.0).powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl<T: ?Sized> BackoffStrategy<T> for ExponentialBackoff {
    fn next_delay(&self, _status: &Status, _target: &T, attempt: u32) -> Option<Duration> {
        if exhausted(self.max_attempts, attempt) {
            return None;
        }
        Some(self.delay_for_attempt(attempt))
    }
}

fn exhausted(max_attempts: Option<u32>, attempt: u32) -> bool {
    matches!(max_attempts, Some(max) if attempt >= max)
}
