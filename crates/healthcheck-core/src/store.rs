//! The `HealthStore` trait and supporting query types.
//!
//! Implemented by storage backends (e.g. `healthcheck-store-sqlite`). The
//! service layer, the API and the sync dispatcher depend on this abstraction
//! only.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  destination::Destination,
  event::{Event, EventKind, NewEvent},
  profile::Profile,
};

// ─── Query types ─────────────────────────────────────────────────────────────

/// Keyset position in a pending-work scan: the last `(at, key)` seen. Event
/// scans order by `created_at`, profile scans by `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor<K> {
  pub at:  DateTime<Utc>,
  pub key: K,
}

/// Parameters for [`HealthStore::find_pending_events`].
#[derive(Debug, Clone)]
pub struct PendingQuery {
  pub destination: Destination,
  /// Restrict to one kind; otherwise every kind the destination consumes.
  pub kind:        Option<EventKind>,
  /// Restrict to one source channel.
  pub source:      Option<String>,
  pub after:       Option<Cursor<Uuid>>,
  /// Exclusive lower bound on `created_at` (a high-water mark).
  pub since:       Option<DateTime<Utc>>,
  pub limit:       usize,
}

impl PendingQuery {
  pub fn new(destination: Destination, limit: usize) -> Self {
    Self { destination, kind: None, source: None, after: None, since: None, limit }
  }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over a health-check store backend.
///
/// Events are append-only; their per-destination sync state is kept apart
/// from them. Profiles are written with compare-and-swap on `version`.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes (e.g. tokio with `axum`).
pub trait HealthStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Events ────────────────────────────────────────────────────────────

  /// Insert an event unless one with the same `(kind, deduplication_key)`
  /// exists. Returns the stored event and whether this call created it.
  fn insert_event(
    &self,
    event: NewEvent,
  ) -> impl Future<Output = Result<(Event, bool), Self::Error>> + Send + '_;

  fn get_event(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<Event>, Self::Error>> + Send + '_;

  /// The most recent event for a contact by `timestamp`, optionally of one
  /// kind and strictly before a point in time.
  fn find_latest_by_contact<'a>(
    &'a self,
    contact_key: &'a str,
    kind: Option<EventKind>,
    before: Option<DateTime<Utc>>,
  ) -> impl Future<Output = Result<Option<Event>, Self::Error>> + Send + 'a;

  /// Every event for a contact, oldest first.
  fn list_events_for_contact<'a>(
    &'a self,
    contact_key: &'a str,
  ) -> impl Future<Output = Result<Vec<Event>, Self::Error>> + Send + 'a;

  /// Events not yet synced to the query's destination, ordered by
  /// `timestamp` then `event_id`.
  fn find_pending_events<'a>(
    &'a self,
    query: &'a PendingQuery,
  ) -> impl Future<Output = Result<Vec<Event>, Self::Error>> + Send + 'a;

  /// Idempotent.
  fn mark_event_synced(
    &self,
    event_id: Uuid,
    destination: Destination,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

  // ── Profiles ──────────────────────────────────────────────────────────

  fn get_profile<'a>(
    &'a self,
    contact_key: &'a str,
  ) -> impl Future<Output = Result<Option<Profile>, Self::Error>> + Send + 'a;

  /// Compare-and-swap write.
  ///
  /// With `expected_version = None` the row must not exist yet; otherwise the
  /// stored version must equal it. On success returns the profile as stored
  /// (bumped `version`, fresh `updated_at`); on conflict returns `None`.
  fn save_profile<'a>(
    &'a self,
    profile: &'a Profile,
    expected_version: Option<i64>,
  ) -> impl Future<Output = Result<Option<Profile>, Self::Error>> + Send + 'a;

  /// Number of consenting profiles in `arm` that arrived via `activation`.
  fn count_group_arm<'a>(
    &'a self,
    arm: &'a str,
    activation: &'a str,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a;

  /// Profiles whose flag for `destination` is `false`, ordered by
  /// `updated_at` then contact key.
  fn find_pending_profiles<'a>(
    &'a self,
    destination: Destination,
    after: Option<&'a Cursor<String>>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<Profile>, Self::Error>> + Send + 'a;

  /// Set the destination flag to `true` if the profile is still at
  /// `seen_version`. Returns whether the flag was set.
  fn mark_profile_synced<'a>(
    &'a self,
    contact_key: &'a str,
    destination: Destination,
    seen_version: i64,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  // ── Sync bookkeeping ──────────────────────────────────────────────────

  /// Take the named advisory lock unless a live holder has it. Never blocks.
  fn try_acquire_lock<'a>(
    &'a self,
    name: &'a str,
    holder: &'a str,
    ttl: std::time::Duration,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  /// Release the lock if `holder` owns it.
  fn release_lock<'a>(
    &'a self,
    name: &'a str,
    holder: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  fn get_high_water_mark<'a>(
    &'a self,
    key: &'a str,
  ) -> impl Future<Output = Result<Option<DateTime<Utc>>, Self::Error>> + Send + 'a;

  fn set_high_water_mark<'a>(
    &'a self,
    key: &'a str,
    at: DateTime<Utc>,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
