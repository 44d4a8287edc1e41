//! Scoped acquisition of a named sync lock.

use std::{future::Future, time::Duration};

use healthcheck_core::store::HealthStore;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Run `body` while holding the lock `name`.
///
/// Returns `Ok(None)` without running `body` when another holder has a live
/// lock. The lock is released whether `body` succeeds or fails; a release
/// failure is logged and otherwise left to the lock's expiry.
pub async fn run_exclusive<S, T, F, Fut>(
  store: &S,
  name: &str,
  holder: &str,
  ttl: Duration,
  body: F,
) -> Result<Option<T>>
where
  S: HealthStore,
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let acquired = store.try_acquire_lock(name, holder, ttl).await.map_err(Error::store)?;
  if !acquired {
    debug!(lock = name, "lock held elsewhere");
    return Ok(None);
  }

  let result = body().await;

  if let Err(e) = store.release_lock(name, holder).await {
    warn!(lock = name, error = %e, "failed to release sync lock");
  }
  result.map(Some)
}
