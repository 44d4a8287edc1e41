//! Event types: one immutable record per submitted health check or
//! registration.
//!
//! Every event carries a shared header (contact key, source, timestamp,
//! extension map) and a typed payload whose variant is the event kind. The
//! variant name doubles as the `kind` discriminant stored in the database.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

use crate::{Result, geo::Coordinate};

/// Free-form key → value attributes that are not promoted to typed fields.
pub type ExtensionMap = Map<String, Value>;

// ─── Kinds ───────────────────────────────────────────────────────────────────

/// The kind of an event, without its payload.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Serialize,
  Deserialize,
  Display,
  AsRefStr,
  EnumString,
  EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
  Triage,
  TbCheck,
  SelfSwabTest,
  VaccineRegistration,
}

// ─── Closed choice sets ──────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
  IntoStaticStr,
)]
pub enum AgeGroup {
  #[serde(rename = "<18")]
  #[strum(serialize = "<18")]
  Under18,
  #[serde(rename = "18-40")]
  #[strum(serialize = "18-40")]
  From18To40,
  #[serde(rename = "40-65")]
  #[strum(serialize = "40-65")]
  From40To65,
  #[serde(rename = ">65")]
  #[strum(serialize = ">65")]
  Over65,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Gender {
  Male,
  Female,
  Other,
  NotSay,
}

/// A three-way answer used for exposure and pre-existing-condition questions.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Answer {
  Yes,
  No,
  NotSure,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RiskLevel {
  Low,
  Moderate,
  High,
  Critical,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr, EnumString,
  IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SwabResult {
  Pending,
  Positive,
  Negative,
  Rejected,
  Invalid,
  Equivocal,
}

// ─── Payloads ────────────────────────────────────────────────────────────────

/// A COVID-19 symptom check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageValue {
  pub province:              Option<String>,
  pub city:                  Option<String>,
  pub age:                   Option<AgeGroup>,
  pub gender:                Option<Gender>,
  pub fever:                 Option<bool>,
  pub cough:                 Option<bool>,
  pub sore_throat:           Option<bool>,
  pub difficulty_breathing:  Option<bool>,
  pub muscle_pain:           Option<bool>,
  pub smell:                 Option<bool>,
  pub preexisting_condition: Option<Answer>,
  pub exposure:              Option<Answer>,
  pub tracing:               Option<bool>,
  pub risk:                  RiskLevel,
  pub location:              Option<Coordinate>,
  pub city_location:         Option<Coordinate>,
  pub language:              Option<String>,
}

/// A TB symptom screen, optionally enrolling the contact in a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TbCheckValue {
  pub province:         Option<String>,
  pub city:             Option<String>,
  pub age:              Option<AgeGroup>,
  pub gender:           Option<Gender>,
  pub cough:            Option<bool>,
  pub fever:            Option<bool>,
  pub sweat:            Option<bool>,
  pub weight:           Option<bool>,
  pub exposure:         Option<Answer>,
  pub tracing:          Option<bool>,
  pub risk:             RiskLevel,
  pub location:         Option<Coordinate>,
  pub city_location:    Option<Coordinate>,
  pub follow_up_optin:  Option<bool>,
  pub language:         Option<String>,
  pub research_consent: Option<bool>,
  /// Study activation code the contact arrived through, if any.
  pub activation:       Option<String>,
  /// Assigned on ingestion, never accepted from callers.
  pub group_arm:        Option<String>,
}

/// The outcome of a self-administered swab test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfSwabTestValue {
  pub barcode:              String,
  pub result:               SwabResult,
  pub collection_timestamp: Option<DateTime<Utc>>,
}

/// Registration of interest in vaccination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaccineRegistrationValue {
  pub first_name:    Option<String>,
  pub last_name:     Option<String>,
  pub date_of_birth: Option<NaiveDate>,
  pub gender:        Option<Gender>,
  pub province:      Option<String>,
  pub city:          Option<String>,
  pub city_location: Option<Coordinate>,
  pub language:      Option<String>,
  pub medical_aid:   Option<bool>,
}

// ─── EventValue ──────────────────────────────────────────────────────────────

/// The typed payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventValue {
  Triage(TriageValue),
  TbCheck(TbCheckValue),
  SelfSwabTest(SelfSwabTestValue),
  VaccineRegistration(VaccineRegistrationValue),
}

impl EventValue {
  pub fn kind(&self) -> EventKind {
    match self {
      Self::Triage(_) => EventKind::Triage,
      Self::TbCheck(_) => EventKind::TbCheck,
      Self::SelfSwabTest(_) => EventKind::SelfSwabTest,
      Self::VaccineRegistration(_) => EventKind::VaccineRegistration,
    }
  }

  /// The result classification every kind shares, if it has one.
  pub fn classification(&self) -> Option<&'static str> {
    match self {
      Self::Triage(v) => Some(v.risk.into()),
      Self::TbCheck(v) => Some(v.risk.into()),
      Self::SelfSwabTest(v) => Some(v.result.into()),
      Self::VaccineRegistration(_) => None,
    }
  }

  /// Serialise the inner payload (without the kind tag) for the `value_json`
  /// database column.
  pub fn to_json(&self) -> Result<Value> {
    let full = serde_json::to_value(self)?;
    Ok(full.get("data").cloned().unwrap_or(Value::Null))
  }

  /// Deserialise from the discriminant string and JSON payload stored in the
  /// database.
  pub fn from_parts(kind: &str, data: Value) -> Result<Self> {
    let wrapped = serde_json::json!({ "kind": kind, "data": data });
    Ok(serde_json::from_value(wrapped)?)
  }
}

// ─── Event ───────────────────────────────────────────────────────────────────

/// A stored submission. Never updated once written; sync state lives in a
/// separate table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
  pub event_id:          Uuid,
  /// Idempotency token; unique per event kind.
  pub deduplication_key: String,
  /// E.164 phone number of the subject.
  pub contact_key:       String,
  pub source:            String,
  pub value:             EventValue,
  pub extension_map:     ExtensionMap,
  /// When the check happened in the real world; may be backdated.
  pub timestamp:         DateTime<Utc>,
  /// Server-assigned at insert.
  pub created_at:        DateTime<Utc>,
  pub created_by:        Option<String>,
}

impl Event {
  pub fn kind(&self) -> EventKind { self.value.kind() }
}

/// Input to [`crate::store::HealthStore::insert_event`]. `event_id` and
/// `created_at` are always set by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
  pub deduplication_key: String,
  pub contact_key:       String,
  pub source:            String,
  pub value:             EventValue,
  pub extension_map:     ExtensionMap,
  pub timestamp:         DateTime<Utc>,
  pub created_by:        Option<String>,
}

impl NewEvent {
  /// Convenience constructor with a generated deduplication key, an empty
  /// extension map and the current time.
  pub fn new(contact_key: impl Into<String>, source: impl Into<String>, value: EventValue) -> Self {
    Self {
      deduplication_key: Uuid::new_v4().to_string(),
      contact_key: contact_key.into(),
      source: source.into(),
      value,
      extension_map: ExtensionMap::new(),
      timestamp: Utc::now(),
      created_by: None,
    }
  }

  pub fn kind(&self) -> EventKind { self.value.kind() }
}
