//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 UTC strings with a fixed microsecond
//! width, so string order is time order. Payloads and extension maps are
//! compact JSON. UUIDs are hyphenated lowercase strings.

use chrono::{DateTime, SecondsFormat, Utc};
use healthcheck_core::{
  event::{Event, EventValue, ExtensionMap},
  profile::Profile,
};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339_opts(SecondsFormat::Micros, true) }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Extension map ───────────────────────────────────────────────────────────

pub fn encode_extension(map: &ExtensionMap) -> Result<String> { Ok(serde_json::to_string(map)?) }

pub fn decode_extension(s: &str) -> Result<ExtensionMap> { Ok(serde_json::from_str(s)?) }

// ─── Profile fields ──────────────────────────────────────────────────────────

/// Keys of a serialised [`Profile`] that live in their own columns rather than
/// in `fields_json`.
const PROFILE_COLUMNS: [&str; 4] = ["contact_key", "extension_map", "version", "updated_at"];

pub fn encode_profile_fields(profile: &Profile) -> Result<String> {
  let mut fields = match serde_json::to_value(profile)? {
    Value::Object(map) => map,
    _ => Map::new(),
  };
  for key in PROFILE_COLUMNS {
    fields.remove(key);
  }
  Ok(Value::Object(fields).to_string())
}

// ─── Row types ───────────────────────────────────────────────────────────────

pub const EVENT_COLUMNS: &str = "event_id, kind, deduplication_key, contact_key, source, \
                                 value_json, extension_json, timestamp, created_at, created_by";

/// Raw strings read directly from an `events` row.
pub struct RawEvent {
  pub event_id:          String,
  pub kind:              String,
  pub deduplication_key: String,
  pub contact_key:       String,
  pub source:            String,
  pub value_json:        String,
  pub extension_json:    String,
  pub timestamp:         String,
  pub created_at:        String,
  pub created_by:        Option<String>,
}

impl RawEvent {
  /// Read a row selected with [`EVENT_COLUMNS`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      event_id:          row.get(0)?,
      kind:              row.get(1)?,
      deduplication_key: row.get(2)?,
      contact_key:       row.get(3)?,
      source:            row.get(4)?,
      value_json:        row.get(5)?,
      extension_json:    row.get(6)?,
      timestamp:         row.get(7)?,
      created_at:        row.get(8)?,
      created_by:        row.get(9)?,
    })
  }

  pub fn into_event(self) -> Result<Event> {
    let value_json: Value = serde_json::from_str(&self.value_json)?;
    let value = EventValue::from_parts(&self.kind, value_json)
      .map_err(|_| Error::UnknownKind(self.kind.clone()))?;

    Ok(Event {
      event_id: decode_uuid(&self.event_id)?,
      deduplication_key: self.deduplication_key,
      contact_key: self.contact_key,
      source: self.source,
      value,
      extension_map: decode_extension(&self.extension_json)?,
      timestamp: decode_dt(&self.timestamp)?,
      created_at: decode_dt(&self.created_at)?,
      created_by: self.created_by,
    })
  }
}

pub const PROFILE_SELECT: &str =
  "contact_key, fields_json, extension_json, version, updated_at";

/// Raw strings read directly from a `profiles` row.
pub struct RawProfile {
  pub contact_key:    String,
  pub fields_json:    String,
  pub extension_json: String,
  pub version:        i64,
  pub updated_at:     String,
}

impl RawProfile {
  /// Read a row selected with [`PROFILE_SELECT`].
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      contact_key:    row.get(0)?,
      fields_json:    row.get(1)?,
      extension_json: row.get(2)?,
      version:        row.get(3)?,
      updated_at:     row.get(4)?,
    })
  }

  pub fn into_profile(self) -> Result<Profile> {
    let mut fields: Map<String, Value> = serde_json::from_str(&self.fields_json)?;
    let updated_at = decode_dt(&self.updated_at)?;
    fields.insert("contact_key".into(), Value::String(self.contact_key));
    fields.insert(
      "extension_map".into(),
      Value::Object(decode_extension(&self.extension_json)?),
    );
    fields.insert("version".into(), Value::from(self.version));
    fields.insert("updated_at".into(), serde_json::to_value(updated_at)?);
    Ok(serde_json::from_value(Value::Object(fields))?)
  }
}

#[cfg(test)]
mod tests {
  use chrono::TimeZone as _;

  use super::*;

  #[test]
  fn timestamps_sort_as_strings() {
    let a = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
    let b = a + chrono::Duration::microseconds(1);
    let c = a + chrono::Duration::seconds(10);
    assert!(encode_dt(a) < encode_dt(b));
    assert!(encode_dt(b) < encode_dt(c));
    assert_eq!(decode_dt(&encode_dt(b)).unwrap(), b);
  }

  #[test]
  fn profile_fields_leave_out_column_keys() {
    let mut profile = Profile::new("+27820001001");
    profile.province = Some("ZA-WC".into());
    let fields: Map<String, Value> =
      serde_json::from_str(&encode_profile_fields(&profile).unwrap()).unwrap();
    assert_eq!(fields.get("province"), Some(&Value::from("ZA-WC")));
    for key in PROFILE_COLUMNS {
      assert!(!fields.contains_key(key));
    }
  }
}
