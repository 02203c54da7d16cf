//! Retry budget and exponential backoff.

use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

use super::error::ErrorKind;

/// Backoff schedule: `base * 2^attempt + jitter`, capped at `max_delay`.
///
/// Jitter is bounded by `max_jitter`, which must not exceed `base` for the
/// schedule to stay non-decreasing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub max_jitter_ms: u64,
  /// Attempts allowed after timeout-class failures
  pub timeout_attempts: u32,
  /// Attempts allowed after any other failure
  pub default_attempts: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      base_delay_ms: 1_000,
      max_delay_ms: 15_000,
      max_jitter_ms: 1_000,
      timeout_attempts: 5,
      default_attempts: 3,
    }
  }
}

impl RetryPolicy {
  /// How many retries a failure of `kind` may schedule.
  pub fn budget(&self, kind: ErrorKind) -> u32 {
    match kind {
      ErrorKind::Timeout => self.timeout_attempts,
      ErrorKind::Other => self.default_attempts,
    }
  }

  /// Delay before retry number `attempt` (zero-based) given a jitter sample.
  ///
  /// The sample is clamped to `max_jitter_ms`, so this is a pure function of
  /// its inputs.
  pub fn delay(&self, attempt: u32, jitter_ms: u64) -> Duration {
    let exp = self
      .base_delay_ms
      .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let jitter = jitter_ms.min(self.max_jitter_ms.saturating_sub(1));
    Duration::from_millis(exp.saturating_add(jitter).min(self.max_delay_ms))
  }

  /// Delay before retry `attempt`, or `None` once the budget for `kind` is spent.
  pub fn next_delay_with(&self, attempt: u32, kind: ErrorKind, jitter_ms: u64) -> Option<Duration> {
    (attempt < self.budget(kind)).then(|| self.delay(attempt, jitter_ms))
  }

  /// Like [`RetryPolicy::next_delay_with`] with a random jitter sample.
  pub fn next_delay(&self, attempt: u32, kind: ErrorKind) -> Option<Duration> {
    let jitter = if self.max_jitter_ms == 0 {
      0
    } else {
      rand::thread_rng().gen_range(0..self.max_jitter_ms)
    };
    self.next_delay_with(attempt, kind, jitter)
  }
}
