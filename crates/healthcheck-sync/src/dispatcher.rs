//! The sync dispatcher: one pass per job over the store's pending work.

use std::{
  future::Future,
  sync::Arc,
  time::{Duration, Instant},
};

use healthcheck_core::{
  destination::Destination,
  event::{Event, EventKind, EventValue},
  profile::Profile,
  store::{Cursor, HealthStore, PendingQuery},
};
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
  Error, Result,
  collaborator::{Column, ColumnType, FlowEngine, MessagingPlatform, Warehouse},
  config::SyncConfig,
  gate,
  http::{HttpFlowEngine, HttpMessaging, HttpWarehouse},
  retry::RetryPolicy,
};

/// Source channel whose contacts exist on the messaging platform.
const WHATSAPP_SOURCE: &str = "WhatsApp";

/// Columns of every per-kind warehouse table.
const WAREHOUSE_SCHEMA: &[Column] = &[
  Column { name: "event_id", kind: ColumnType::String },
  Column { name: "msisdn_hash", kind: ColumnType::String },
  Column { name: "source", kind: ColumnType::String },
  Column { name: "timestamp", kind: ColumnType::Timestamp },
  Column { name: "created_at", kind: ColumnType::Timestamp },
  Column { name: "created_by", kind: ColumnType::String },
  Column { name: "classification", kind: ColumnType::String },
  Column { name: "payload", kind: ColumnType::Json },
  Column { name: "data", kind: ColumnType::Json },
];

// ─── Outcome ─────────────────────────────────────────────────────────────────

/// Result of one `run_sync` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SyncOutcome {
  /// Another pass for the same job is in progress.
  LockHeld,
  /// The job's collaborator is not configured; nothing was attempted.
  NotConfigured { reason: String },
  /// `dispatched`, `skipped` and `failed` count records. `deferred` counts
  /// warehouse tables left untouched because their high-water mark could not
  /// be read; their records stay pending for the next pass.
  Completed { dispatched: u64, skipped: u64, failed: u64, deferred: u64 },
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
  dispatched: u64,
  skipped:    u64,
  failed:     u64,
  deferred:   u64,
}

impl From<Tally> for SyncOutcome {
  fn from(t: Tally) -> Self {
    Self::Completed {
      dispatched: t.dispatched,
      skipped:    t.skipped,
      failed:     t.failed,
      deferred:   t.deferred,
    }
  }
}

enum Delivery {
  Sent,
  NothingToSend,
}

// ─── Dispatcher ──────────────────────────────────────────────────────────────

struct TbFollowupTarget {
  engine:  Arc<dyn FlowEngine>,
  flow_id: String,
}

struct WarehouseTarget {
  warehouse: Arc<dyn Warehouse>,
  dataset:   String,
}

pub struct Dispatcher<S> {
  store:       Arc<S>,
  lock_ttl:    Duration,
  batch_size:  usize,
  retry:       RetryPolicy,
  tb_followup: Option<Arc<TbFollowupTarget>>,
  warehouse:   Option<Arc<WarehouseTarget>>,
  messaging:   Option<Arc<dyn MessagingPlatform>>,
}

impl<S> Clone for Dispatcher<S> {
  fn clone(&self) -> Self {
    Self {
      store:       Arc::clone(&self.store),
      lock_ttl:    self.lock_ttl,
      batch_size:  self.batch_size,
      retry:       self.retry,
      tb_followup: self.tb_followup.clone(),
      warehouse:   self.warehouse.clone(),
      messaging:   self.messaging.clone(),
    }
  }
}

impl<S: HealthStore> Dispatcher<S> {
  /// A dispatcher with no collaborators; every job reports
  /// [`SyncOutcome::NotConfigured`] until one is attached.
  pub fn new(store: Arc<S>, config: &SyncConfig) -> Self {
    Self {
      store,
      lock_ttl: config.lock_ttl(),
      batch_size: config.batch_size.max(1),
      retry: RetryPolicy::from(&config.retry),
      tb_followup: None,
      warehouse: None,
      messaging: None,
    }
  }

  /// Build a dispatcher with HTTP clients for every configured collaborator.
  pub fn from_config(store: Arc<S>, config: &SyncConfig) -> Result<Self> {
    let (connect, request) = (config.connect_timeout(), config.request_timeout());
    let mut dispatcher = Self::new(store, config);

    if let Some(c) = &config.flow_engine {
      let engine = HttpFlowEngine::new(&c.url, &c.token, connect, request)?;
      dispatcher = dispatcher.with_tb_followup(Arc::new(engine), &c.tb_followup_flow_id);
    }
    if let Some(c) = &config.warehouse {
      let warehouse = HttpWarehouse::new(&c.url, &c.token, connect, request)?;
      dispatcher = dispatcher.with_warehouse(Arc::new(warehouse), &c.dataset);
    }
    if let Some(c) = &config.messaging {
      let messaging = HttpMessaging::new(&c.url, &c.token, connect, request)?;
      dispatcher = dispatcher.with_messaging(Arc::new(messaging));
    }
    Ok(dispatcher)
  }

  pub fn with_tb_followup(mut self, engine: Arc<dyn FlowEngine>, flow_id: &str) -> Self {
    self.tb_followup = Some(Arc::new(TbFollowupTarget { engine, flow_id: flow_id.to_owned() }));
    self
  }

  pub fn with_warehouse(mut self, warehouse: Arc<dyn Warehouse>, dataset: &str) -> Self {
    self.warehouse = Some(Arc::new(WarehouseTarget { warehouse, dataset: dataset.to_owned() }));
    self
  }

  pub fn with_messaging(mut self, messaging: Arc<dyn MessagingPlatform>) -> Self {
    self.messaging = Some(messaging);
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_batch_size(mut self, batch_size: usize) -> Self {
    self.batch_size = batch_size.max(1);
    self
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  /// Whether the collaborator behind `destination` has been attached.
  pub fn is_configured(&self, destination: Destination) -> bool {
    match destination {
      Destination::TbFollowup => self.tb_followup.is_some(),
      Destination::Warehouse => self.warehouse.is_some(),
      Destination::MessagingProfile => self.messaging.is_some(),
    }
  }

  // ── Entry point ───────────────────────────────────────────────────────

  /// Run one pass of the job named `job`.
  ///
  /// # Errors
  ///
  /// [`Error::UnknownJob`] for a name that is not a destination, or a store
  /// error. Collaborator failures are counted in the outcome instead.
  pub async fn run_sync(&self, job: &str) -> Result<SyncOutcome> {
    let destination: Destination =
      job.parse().map_err(|_| Error::UnknownJob(job.to_owned()))?;

    match destination {
      Destination::TbFollowup => match self.tb_followup.clone() {
        Some(target) => self.gated(destination, || self.sync_tb_followup(target)).await,
        None => Ok(not_configured(destination, "flow_engine")),
      },
      Destination::Warehouse => match self.warehouse.clone() {
        Some(target) => self.gated(destination, || self.sync_warehouse(target)).await,
        None => Ok(not_configured(destination, "warehouse")),
      },
      Destination::MessagingProfile => match self.messaging.clone() {
        Some(target) => self.gated(destination, || self.sync_messaging(target)).await,
        None => Ok(not_configured(destination, "messaging")),
      },
    }
  }

  async fn gated<F, Fut>(&self, destination: Destination, pass: F) -> Result<SyncOutcome>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Tally>>,
  {
    let job = destination.job_name();
    let holder = Uuid::new_v4().to_string();
    let started = Instant::now();

    match gate::run_exclusive(&*self.store, job, &holder, self.lock_ttl, pass).await? {
      None => {
        info!(job, "sync pass skipped, lock held");
        Ok(SyncOutcome::LockHeld)
      }
      Some(tally) => {
        info!(
          job,
          dispatched = tally.dispatched,
          skipped = tally.skipped,
          failed = tally.failed,
          deferred = tally.deferred,
          elapsed_ms = started.elapsed().as_millis() as u64,
          "sync pass completed"
        );
        Ok(tally.into())
      }
    }
  }

  // ── tb_followup ───────────────────────────────────────────────────────

  async fn sync_tb_followup(&self, target: Arc<TbFollowupTarget>) -> Result<Tally> {
    let destination = Destination::TbFollowup;
    let mut tally = Tally::default();
    let mut cursor: Option<Cursor<String>> = None;

    loop {
      let page = self
        .store
        .find_pending_profiles(destination, cursor.as_ref(), self.batch_size)
        .await
        .map_err(Error::store)?;

      for profile in &page {
        match self.deliver_tb_followup(&target, profile).await {
          Ok(delivery) => {
            let marked = self
              .store
              .mark_profile_synced(&profile.contact_key, destination, profile.version)
              .await
              .map_err(Error::store)?;
            if !marked {
              debug!("profile changed during dispatch, left for next pass");
            }
            match delivery {
              Delivery::Sent => tally.dispatched += 1,
              Delivery::NothingToSend => tally.skipped += 1,
            }
          }
          Err(e) => {
            warn!(error = %e, "tb follow-up dispatch failed");
            tally.failed += 1;
          }
        }
      }

      match page.last() {
        Some(last) if page.len() >= self.batch_size => {
          cursor = Some(Cursor {
            at:  last.updated_at.unwrap_or_default(),
            key: last.contact_key.clone(),
          });
        }
        _ => break,
      }
    }
    Ok(tally)
  }

  async fn deliver_tb_followup(
    &self,
    target: &TbFollowupTarget,
    profile: &Profile,
  ) -> Result<Delivery> {
    let opted_in = profile.extension_map.get("follow_up_optin").and_then(Value::as_bool);
    if opted_in != Some(true) {
      return Ok(Delivery::NothingToSend);
    }

    let latest = self
      .store
      .find_latest_by_contact(&profile.contact_key, Some(EventKind::TbCheck), None)
      .await
      .map_err(Error::store)?;
    let Some(event) = latest else {
      return Ok(Delivery::NothingToSend);
    };
    let EventValue::TbCheck(check) = &event.value else {
      return Ok(Delivery::NothingToSend);
    };

    let urn = contact_urn(&event.source, &profile.contact_key);
    let existing = self.retry.run("list flow contacts", || target.engine.list_contacts(&urn)).await?;
    if existing.is_empty() {
      let mut fields = Map::new();
      if let Some(language) = check.language.as_ref().or(profile.language.as_ref()) {
        fields.insert("preferred_language".into(), Value::from(language.as_str()));
      }
      self
        .retry
        .run("create flow contact", || target.engine.create_contact(&urn, None, &fields))
        .await?;
    }

    let extra = json!({
      "risk":       check.risk,
      "language":   check.language.as_ref().or(profile.language.as_ref()),
      "group_arm":  profile.group_arm,
      "activation": profile.activation,
    });
    let urns = [urn];
    self
      .retry
      .run("start follow-up flow", || {
        target.engine.create_flow_start(&urns, &target.flow_id, &extra)
      })
      .await?;
    Ok(Delivery::Sent)
  }

  // ── warehouse ─────────────────────────────────────────────────────────

  async fn sync_warehouse(&self, target: Arc<WarehouseTarget>) -> Result<Tally> {
    let mut tally = Tally::default();
    for &kind in Destination::Warehouse.event_kinds() {
      self.sync_warehouse_table(&target, kind, &mut tally).await?;
    }
    Ok(tally)
  }

  /// Upload pending events of one kind in batches. A failed batch ends the
  /// kind's pass so the high-water mark never moves past undelivered rows.
  async fn sync_warehouse_table(
    &self,
    target: &WarehouseTarget,
    kind: EventKind,
    tally: &mut Tally,
  ) -> Result<()> {
    let table: &str = kind.as_ref();
    let mark_key = format!("warehouse:{table}");

    let since = match self.store.get_high_water_mark(&mark_key).await.map_err(Error::store)? {
      Some(at) => Some(at),
      None => {
        let remote = self
          .retry
          .run("query warehouse max", || {
            target.warehouse.query_max(&target.dataset, table, "created_at")
          })
          .await;
        match remote {
          Ok(Some(at)) => {
            self.store.set_high_water_mark(&mark_key, at).await.map_err(Error::store)?;
            Some(at)
          }
          Ok(None) => None,
          Err(e) => {
            warn!(table, error = %e, "could not read warehouse high-water mark");
            tally.deferred += 1;
            return Ok(());
          }
        }
      }
    };

    let mut query = PendingQuery::new(Destination::Warehouse, self.batch_size);
    query.kind = Some(kind);
    query.since = since;

    loop {
      let batch = self.store.find_pending_events(&query).await.map_err(Error::store)?;
      let Some(last) = batch.last() else { break };

      let rows = batch.iter().map(warehouse_row).collect::<Result<Vec<_>>>()?;
      let loaded = self
        .retry
        .run("load warehouse rows", || {
          target.warehouse.load_rows(&target.dataset, table, WAREHOUSE_SCHEMA, &rows)
        })
        .await;
      if let Err(e) = loaded {
        warn!(table, rows = batch.len(), error = %e, "warehouse upload failed");
        tally.failed += batch.len() as u64;
        break;
      }

      for event in &batch {
        self
          .store
          .mark_event_synced(event.event_id, Destination::Warehouse)
          .await
          .map_err(Error::store)?;
      }
      self.store.set_high_water_mark(&mark_key, last.created_at).await.map_err(Error::store)?;
      tally.dispatched += batch.len() as u64;
      debug!(table, rows = batch.len(), "warehouse batch loaded");

      if batch.len() < self.batch_size {
        break;
      }
      query.after = Some(Cursor { at: last.created_at, key: last.event_id });
    }
    Ok(())
  }

  // ── messaging_profile ─────────────────────────────────────────────────

  async fn sync_messaging(&self, messaging: Arc<dyn MessagingPlatform>) -> Result<Tally> {
    let destination = Destination::MessagingProfile;
    let mut tally = Tally::default();
    let mut query = PendingQuery::new(destination, self.batch_size);
    query.kind = Some(EventKind::Triage);
    query.source = Some(WHATSAPP_SOURCE.to_owned());

    loop {
      let batch = self.store.find_pending_events(&query).await.map_err(Error::store)?;
      let Some(last) = batch.last() else { break };

      for event in &batch {
        let EventValue::Triage(triage) = &event.value else {
          self.store.mark_event_synced(event.event_id, destination).await.map_err(Error::store)?;
          tally.skipped += 1;
          continue;
        };
        let contact_id = event.contact_key.trim_start_matches('+');
        let fields = json!({
          "healthcheck_risk":         triage.risk,
          "healthcheck_completed_at": event.timestamp,
        });
        let patched = self
          .retry
          .run("patch messaging profile", || messaging.patch_contact_profile(contact_id, &fields))
          .await;
        match patched {
          Ok(()) => {
            self
              .store
              .mark_event_synced(event.event_id, destination)
              .await
              .map_err(Error::store)?;
            tally.dispatched += 1;
          }
          Err(e) => {
            warn!(event_id = %event.event_id, error = %e, "messaging profile update failed");
            tally.failed += 1;
          }
        }
      }

      if batch.len() < self.batch_size {
        break;
      }
      query.after = Some(Cursor { at: last.created_at, key: last.event_id });
    }
    Ok(tally)
  }
}

// ─── Payload helpers ─────────────────────────────────────────────────────────

fn not_configured(destination: Destination, section: &str) -> SyncOutcome {
  info!(job = destination.job_name(), section, "sync job not configured");
  SyncOutcome::NotConfigured { reason: format!("sync.{section} is not configured") }
}

/// Flow-engine URN for a contact reached through `source`.
fn contact_urn(source: &str, contact_key: &str) -> String {
  if source.eq_ignore_ascii_case(WHATSAPP_SOURCE) {
    format!("whatsapp:{}", contact_key.trim_start_matches('+'))
  } else {
    format!("tel:{contact_key}")
  }
}

/// One-way hash of a phone number for analytics tables.
pub fn hash_msisdn(contact_key: &str) -> String {
  hex::encode(Sha256::digest(contact_key.as_bytes()))
}

fn warehouse_row(event: &Event) -> Result<Value> {
  Ok(json!({
    "event_id":       event.event_id,
    "msisdn_hash":    hash_msisdn(&event.contact_key),
    "source":         event.source,
    "timestamp":      event.timestamp,
    "created_at":     event.created_at,
    "created_by":     event.created_by,
    "classification": event.value.classification(),
    "payload":        event.value.to_json()?.to_string(),
    "data":           Value::Object(event.extension_map.clone()).to_string(),
  }))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn urn_follows_source_channel() {
    assert_eq!(contact_urn("WhatsApp", "+27821110000"), "whatsapp:27821110000");
    assert_eq!(contact_urn("USSD", "+27821110000"), "tel:+27821110000");
  }

  #[test]
  fn msisdn_hash_is_stable_hex() {
    let h = hash_msisdn("+27820001001");
    assert_eq!(h.len(), 64);
    assert_eq!(h, hash_msisdn("+27820001001"));
    assert_ne!(h, hash_msisdn("+27820001002"));
  }

  #[test]
  fn outcome_serialises_with_status_tag() {
    let done = SyncOutcome::Completed { dispatched: 2, skipped: 1, failed: 0, deferred: 0 };
    assert_eq!(
      serde_json::to_value(&done).unwrap(),
      json!({ "status": "completed", "dispatched": 2, "skipped": 1, "failed": 0, "deferred": 0 })
    );
    assert_eq!(serde_json::to_value(SyncOutcome::LockHeld).unwrap(), json!({ "status": "lock_held" }));
  }
}
