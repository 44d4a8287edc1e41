//! `sync` section of the server configuration.

use std::{collections::BTreeMap, time::Duration};

use serde::Deserialize;

use crate::retry::RetryConfig;

#[derive(Clone, Deserialize)]
pub struct FlowEngineConfig {
  pub url:                 String,
  pub token:               String,
  pub tb_followup_flow_id: String,
}

#[derive(Clone, Deserialize)]
pub struct WarehouseConfig {
  pub url:     String,
  pub token:   String,
  pub dataset: String,
}

#[derive(Clone, Deserialize)]
pub struct MessagingConfig {
  pub url:   String,
  pub token: String,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Expiry of a job lock left behind by a crashed process.
  pub lock_ttl_secs:        u64,
  pub batch_size:           usize,
  pub connect_timeout_secs: u64,
  pub request_timeout_secs: u64,
  pub retry:                RetryConfig,
  /// Seconds between scheduled passes, per job name. Unlisted jobs only run
  /// on demand; `0` disables a job's schedule.
  pub interval_secs:        BTreeMap<String, u64>,
  pub flow_engine:          Option<FlowEngineConfig>,
  pub warehouse:            Option<WarehouseConfig>,
  pub messaging:            Option<MessagingConfig>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      lock_ttl_secs:        1800,
      batch_size:           100,
      connect_timeout_secs: 5,
      request_timeout_secs: 15,
      retry:                RetryConfig::default(),
      interval_secs:        BTreeMap::from([
        ("tb_followup".to_owned(), 300),
        ("warehouse".to_owned(), 3600),
        ("messaging_profile".to_owned(), 300),
      ]),
      flow_engine:          None,
      warehouse:            None,
      messaging:            None,
    }
  }
}

impl SyncConfig {
  pub fn lock_ttl(&self) -> Duration { Duration::from_secs(self.lock_ttl_secs) }

  pub fn connect_timeout(&self) -> Duration { Duration::from_secs(self.connect_timeout_secs) }

  pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
}
