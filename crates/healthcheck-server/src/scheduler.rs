//! Periodic sync passes: one tokio task per scheduled job.
//!
//! Overlapping passes, from this process or another one sharing the store,
//! are prevented by the job lock inside [`Dispatcher::run_sync`].

use std::{collections::BTreeMap, time::Duration};

use healthcheck_core::{destination::Destination, store::HealthStore};
use healthcheck_sync::{Dispatcher, SyncOutcome};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

/// Jobs to schedule: configured, known, and with a non-zero interval.
pub fn plan<S: HealthStore>(
  dispatcher: &Dispatcher<S>,
  interval_secs: &BTreeMap<String, u64>,
) -> Vec<(Destination, Duration)> {
  let mut jobs = Vec::new();
  for (job, &secs) in interval_secs {
    let Ok(destination) = job.parse::<Destination>() else {
      warn!(job, "ignoring interval for unknown sync job");
      continue;
    };
    if secs == 0 || !dispatcher.is_configured(destination) {
      continue;
    }
    jobs.push((destination, Duration::from_secs(secs)));
  }
  jobs
}

/// Spawn a task per planned job. The first pass runs immediately.
pub fn spawn<S>(
  dispatcher: &Dispatcher<S>,
  interval_secs: &BTreeMap<String, u64>,
) -> Vec<JoinHandle<()>>
where
  S: HealthStore + 'static,
{
  plan(dispatcher, interval_secs)
    .into_iter()
    .map(|(destination, period)| {
      let dispatcher = dispatcher.clone();
      let job = destination.job_name();
      info!(job, period_secs = period.as_secs(), "scheduling sync job");
      tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
          ticker.tick().await;
          match dispatcher.run_sync(job).await {
            Ok(SyncOutcome::LockHeld) => debug!(job, "previous pass still running"),
            Ok(outcome) => debug!(job, ?outcome, "scheduled pass finished"),
            Err(e) => warn!(job, error = %e, "scheduled pass failed"),
          }
        }
      })
    })
    .collect()
}
