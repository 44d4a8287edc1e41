//! [`SqliteStore`], the SQLite implementation of [`HealthStore`].

use std::{path::Path, time::Duration};

use chrono::{DateTime, SubsecRound as _, Utc};
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use healthcheck_core::{
  destination::Destination,
  event::{Event, EventKind, NewEvent},
  profile::Profile,
  store::{Cursor, HealthStore, PendingQuery},
};

use crate::{
  Error, Result,
  encode::{
    EVENT_COLUMNS, PROFILE_SELECT, RawEvent, RawProfile, decode_dt, encode_dt, encode_extension,
    encode_profile_fields, encode_uuid,
  },
  schema::SCHEMA,
};

/// How long a writer waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Store ───────────────────────────────────────────────────────────────────

/// A health-check store backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store for tests.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Number of stored events; used by tests and diagnostics.
  pub async fn count_events(&self) -> Result<u64> {
    let n: i64 = self
      .conn
      .call(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?))
      .await?;
    Ok(n.max(0) as u64)
  }

  async fn query_events(
    &self,
    sql: String,
    params: Vec<Option<String>>,
  ) -> Result<Vec<Event>> {
    let raws: Vec<RawEvent> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(rusqlite::params_from_iter(params), RawEvent::from_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawEvent::into_event).collect()
  }
}

/// `created_at` for the next event: now, or just after the newest existing
/// one if the clock has not moved past it. Keeps insert order and
/// `created_at` order identical, which pending scans depend on.
fn next_created_at(latest: Option<&str>, now: DateTime<Utc>) -> String {
  let now = now.trunc_subsecs(6);
  let floor = latest
    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    .map(|dt| dt.with_timezone(&Utc) + chrono::Duration::microseconds(1));
  match floor {
    Some(floor) if floor > now => encode_dt(floor),
    _ => encode_dt(now),
  }
}

// ─── HealthStore impl ────────────────────────────────────────────────────────

impl HealthStore for SqliteStore {
  type Error = Error;

  // ── Events ────────────────────────────────────────────────────────────────

  async fn insert_event(&self, input: NewEvent) -> Result<(Event, bool)> {
    let id_str         = encode_uuid(Uuid::new_v4());
    let kind           = input.kind().to_string();
    let value_json     = input.value.to_json()?.to_string();
    let extension_json = encode_extension(&input.extension_map)?;
    let timestamp      = encode_dt(input.timestamp);

    let (raw, created) = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let latest: Option<String> =
          tx.query_row("SELECT MAX(created_at) FROM events", [], |row| row.get(0))?;
        let created_at = next_created_at(latest.as_deref(), Utc::now());
        let inserted = tx.execute(
          "INSERT INTO events (
             event_id, kind, deduplication_key, contact_key, source,
             value_json, extension_json, timestamp, created_at, created_by
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
           ON CONFLICT (kind, deduplication_key) DO NOTHING",
          rusqlite::params![
            id_str,
            kind,
            input.deduplication_key,
            input.contact_key,
            input.source,
            value_json,
            extension_json,
            timestamp,
            created_at,
            input.created_by,
          ],
        )?;
        let raw = tx.query_row(
          &format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE kind = ?1 AND deduplication_key = ?2"
          ),
          rusqlite::params![kind, input.deduplication_key],
          RawEvent::from_row,
        )?;
        tx.commit()?;
        Ok((raw, inserted == 1))
      })
      .await?;

    Ok((raw.into_event()?, created))
  }

  async fn get_event(&self, id: Uuid) -> Result<Option<Event>> {
    let id_str = encode_uuid(id);

    let raw: Option<RawEvent> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {EVENT_COLUMNS} FROM events WHERE event_id = ?1"),
            rusqlite::params![id_str],
            RawEvent::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawEvent::into_event).transpose()
  }

  async fn find_latest_by_contact(
    &self,
    contact_key: &str,
    kind: Option<EventKind>,
    before: Option<DateTime<Utc>>,
  ) -> Result<Option<Event>> {
    let sql = format!(
      "SELECT {EVENT_COLUMNS} FROM events
       WHERE contact_key = ?1
         AND (?2 IS NULL OR kind = ?2)
         AND (?3 IS NULL OR timestamp < ?3)
       ORDER BY timestamp DESC, created_at DESC
       LIMIT 1"
    );
    let params = vec![
      Some(contact_key.to_owned()),
      kind.map(|k| k.to_string()),
      before.map(encode_dt),
    ];
    Ok(self.query_events(sql, params).await?.into_iter().next())
  }

  async fn list_events_for_contact(&self, contact_key: &str) -> Result<Vec<Event>> {
    let sql = format!(
      "SELECT {EVENT_COLUMNS} FROM events
       WHERE contact_key = ?1
       ORDER BY timestamp, created_at"
    );
    self.query_events(sql, vec![Some(contact_key.to_owned())]).await
  }

  async fn find_pending_events(&self, query: &PendingQuery) -> Result<Vec<Event>> {
    let kinds: Vec<String> = match query.kind {
      Some(kind) if query.destination.event_kinds().contains(&kind) => vec![kind.to_string()],
      Some(_) => return Ok(Vec::new()),
      None => query.destination.event_kinds().iter().map(ToString::to_string).collect(),
    };
    if kinds.is_empty() || query.limit == 0 {
      return Ok(Vec::new());
    }

    let sql = format!(
      "SELECT {EVENT_COLUMNS} FROM events e
       WHERE e.kind IN (SELECT value FROM json_each(?1))
         AND (?2 IS NULL OR e.source = ?2)
         AND (?3 IS NULL OR e.created_at > ?3)
         AND (?4 IS NULL OR e.created_at > ?4 OR (e.created_at = ?4 AND e.event_id > ?5))
         AND NOT EXISTS (
           SELECT 1 FROM event_syncs s
           WHERE s.event_id = e.event_id AND s.destination = ?6
         )
       ORDER BY e.created_at, e.event_id
       LIMIT CAST(?7 AS INTEGER)"
    );
    let params = vec![
      Some(serde_json::to_string(&kinds)?),
      query.source.clone(),
      query.since.map(encode_dt),
      query.after.as_ref().map(|c| encode_dt(c.at)),
      query.after.as_ref().map(|c| encode_uuid(c.key)),
      Some(query.destination.to_string()),
      Some(query.limit.to_string()),
    ];
    self.query_events(sql, params).await
  }

  async fn mark_event_synced(&self, event_id: Uuid, destination: Destination) -> Result<()> {
    let id_str = encode_uuid(event_id);
    let dest   = destination.to_string();
    let at_str = encode_dt(Utc::now());

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO event_syncs (event_id, destination, synced_at) VALUES (?1, ?2, ?3)
           ON CONFLICT (event_id, destination) DO NOTHING",
          rusqlite::params![id_str, dest, at_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Profiles ──────────────────────────────────────────────────────────────

  async fn get_profile(&self, contact_key: &str) -> Result<Option<Profile>> {
    let key = contact_key.to_owned();

    let raw: Option<RawProfile> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            &format!("SELECT {PROFILE_SELECT} FROM profiles WHERE contact_key = ?1"),
            rusqlite::params![key],
            RawProfile::from_row,
          )
          .optional()?)
      })
      .await?;

    raw.map(RawProfile::into_profile).transpose()
  }

  async fn save_profile(
    &self,
    profile: &Profile,
    expected_version: Option<i64>,
  ) -> Result<Option<Profile>> {
    let mut saved = profile.clone();
    saved.version = expected_version.unwrap_or(0) + 1;
    // Stored with microsecond precision; keep the returned copy identical.
    saved.updated_at = Some(Utc::now().trunc_subsecs(6));

    let key              = saved.contact_key.clone();
    let fields_json      = encode_profile_fields(&saved)?;
    let extension_json   = encode_extension(&saved.extension_map)?;
    let research_consent = saved.research_consent;
    let activation       = saved.activation.clone();
    let group_arm        = saved.group_arm.clone();
    let version          = saved.version;
    let updated_at       = saved.updated_at.map(encode_dt);

    let changed = self
      .conn
      .call(move |conn| {
        let n = match expected_version {
          None => conn.execute(
            "INSERT INTO profiles (
               contact_key, fields_json, extension_json,
               research_consent, activation, group_arm, version, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (contact_key) DO NOTHING",
            rusqlite::params![
              key,
              fields_json,
              extension_json,
              research_consent,
              activation,
              group_arm,
              version,
              updated_at,
            ],
          )?,
          Some(expected) => conn.execute(
            "UPDATE profiles SET
               fields_json = ?2, extension_json = ?3,
               research_consent = ?4, activation = ?5, group_arm = ?6,
               version = ?7, updated_at = ?8
             WHERE contact_key = ?1 AND version = ?9",
            rusqlite::params![
              key,
              fields_json,
              extension_json,
              research_consent,
              activation,
              group_arm,
              version,
              updated_at,
              expected,
            ],
          )?,
        };
        Ok(n == 1)
      })
      .await?;

    Ok(changed.then_some(saved))
  }

  async fn count_group_arm(&self, arm: &str, activation: &str) -> Result<u64> {
    let arm = arm.to_owned();
    let activation = activation.to_owned();

    let n: i64 = self
      .conn
      .call(move |conn| {
        Ok(conn.query_row(
          "SELECT COUNT(*) FROM profiles
           WHERE group_arm = ?1 AND activation = ?2 AND research_consent = 1",
          rusqlite::params![arm, activation],
          |r| r.get(0),
        )?)
      })
      .await?;
    Ok(n.max(0) as u64)
  }

  async fn find_pending_profiles(
    &self,
    destination: Destination,
    after: Option<&Cursor<String>>,
    limit: usize,
  ) -> Result<Vec<Profile>> {
    let Some(flag) = destination.profile_flag() else {
      return Ok(Vec::new());
    };
    let path      = format!("$.{flag}");
    let after_at  = after.map(|c| encode_dt(c.at));
    let after_key = after.map(|c| c.key.clone());
    let limit     = i64::try_from(limit).unwrap_or(i64::MAX);

    let raws: Vec<RawProfile> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {PROFILE_SELECT} FROM profiles
           WHERE json_extract(extension_json, ?1) = 0
             AND (?2 IS NULL OR updated_at > ?2
                  OR (updated_at = ?2 AND contact_key > ?3))
           ORDER BY updated_at, contact_key
           LIMIT ?4"
        ))?;
        let rows = stmt
          .query_map(
            rusqlite::params![path, after_at, after_key, limit],
            RawProfile::from_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawProfile::into_profile).collect()
  }

  async fn mark_profile_synced(
    &self,
    contact_key: &str,
    destination: Destination,
    seen_version: i64,
  ) -> Result<bool> {
    let Some(flag) = destination.profile_flag() else {
      return Ok(false);
    };
    let path = format!("$.{flag}");
    let key  = contact_key.to_owned();

    let changed = self
      .conn
      .call(move |conn| {
        let n = conn.execute(
          "UPDATE profiles
           SET extension_json = json_set(extension_json, ?1, json('true')),
               version = version + 1
           WHERE contact_key = ?2 AND version = ?3",
          rusqlite::params![path, key, seen_version],
        )?;
        Ok(n == 1)
      })
      .await?;
    Ok(changed)
  }

  // ── Sync bookkeeping ──────────────────────────────────────────────────────

  async fn try_acquire_lock(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
    let ttl = chrono::Duration::from_std(ttl).map_err(|e| Error::OutOfRange(e.to_string()))?;
    let now = Utc::now();
    let expires_at = now
      .checked_add_signed(ttl)
      .ok_or_else(|| Error::OutOfRange(format!("lock ttl {ttl}")))?;

    let name       = name.to_owned();
    let holder     = holder.to_owned();
    let now_str    = encode_dt(now);
    let expiry_str = encode_dt(expires_at);

    let acquired = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "DELETE FROM sync_locks WHERE name = ?1 AND expires_at <= ?2",
          rusqlite::params![name, now_str],
        )?;
        let n = tx.execute(
          "INSERT INTO sync_locks (name, holder, expires_at) VALUES (?1, ?2, ?3)
           ON CONFLICT (name) DO NOTHING",
          rusqlite::params![name, holder, expiry_str],
        )?;
        tx.commit()?;
        Ok(n == 1)
      })
      .await?;
    Ok(acquired)
  }

  async fn release_lock(&self, name: &str, holder: &str) -> Result<()> {
    let name = name.to_owned();
    let holder = holder.to_owned();

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM sync_locks WHERE name = ?1 AND holder = ?2",
          rusqlite::params![name, holder],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_high_water_mark(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
    let key = key.to_owned();

    let raw: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(conn
          .query_row(
            "SELECT high_water FROM sync_marks WHERE mark_key = ?1",
            rusqlite::params![key],
            |r| r.get(0),
          )
          .optional()?)
      })
      .await?;

    raw.as_deref().map(decode_dt).transpose()
  }

  async fn set_high_water_mark(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
    let key = key.to_owned();
    let at_str = encode_dt(at);

    // Marks only move forward.
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO sync_marks (mark_key, high_water) VALUES (?1, ?2)
           ON CONFLICT (mark_key) DO UPDATE
           SET high_water = MAX(high_water, excluded.high_water)",
          rusqlite::params![key, at_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
