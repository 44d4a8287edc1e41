//! Bounded retries with exponential backoff for collaborator calls.

use std::{future::Future, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::Result;

/// `retry` section of the sync configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts:  u32,
  pub base_delay_ms: u64,
  pub max_delay_ms:  u64,
}

impl Default for RetryConfig {
  fn default() -> Self { Self { max_attempts: 3, base_delay_ms: 500, max_delay_ms: 30_000 } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, including the first. Never less than one.
  pub max_attempts: u32,
  pub base_delay:   Duration,
  pub max_delay:    Duration,
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(c: &RetryConfig) -> Self {
    Self {
      max_attempts: c.max_attempts.max(1),
      base_delay:   Duration::from_millis(c.base_delay_ms),
      max_delay:    Duration::from_millis(c.max_delay_ms),
    }
  }
}

impl RetryPolicy {
  /// No waiting between attempts.
  pub fn immediate(max_attempts: u32) -> Self {
    Self { max_attempts: max_attempts.max(1), base_delay: Duration::ZERO, max_delay: Duration::ZERO }
  }

  /// Delay after the `attempt`-th failure (1-based): the base delay doubled
  /// per prior failure, capped at `max_delay`.
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Run `op` until it succeeds, fails permanently, or attempts run out.
  /// Returns the last error.
  pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut attempt = 1;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(e) if e.is_transient() && attempt < self.max_attempts => {
          let delay = self.delay_after(attempt);
          warn!(attempt, error = %e, ?delay, "{what} failed, retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(e) => return Err(e),
      }
    }
  }
}
