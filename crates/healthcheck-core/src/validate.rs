//! Validation and normalisation of raw submissions.
//!
//! The validator never stops at the first problem: every invalid field is
//! collected into a [`ValidationErrors`] map keyed by field name.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use phonenumber::{Mode, country};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{
  Error, Result,
  event::{
    EventKind, EventValue, ExtensionMap, NewEvent, SelfSwabTestValue, TbCheckValue,
    TriageValue, VaccineRegistrationValue,
  },
  geo::Coordinate,
};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneNumberError {
  ParseError,
  NotPossible,
  NotValid,
}

impl fmt::Display for PhoneNumberError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::ParseError => "could not be parsed",
      Self::NotPossible => "not a possible phone number",
      Self::NotValid => "not a valid phone number",
    })
  }
}

/// One problem with one field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FieldError {
  #[error("this field is required")]
  Missing,

  #[error("expected {expected}")]
  InvalidType { expected: &'static str },

  #[error("invalid phone number: {reason}")]
  InvalidPhoneNumber { reason: PhoneNumberError },

  #[error("invalid ISO 6709 coordinate")]
  InvalidCoordinate,

  #[error("{value:?} is not a valid choice for {field}")]
  InvalidEnum { field: String, value: String },

  #[error("invalid date or time: {0}")]
  InvalidDate(String),

  #[error("one of {0} is required")]
  MissingLocation(&'static str),
}

impl Serialize for FieldError {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

/// Every invalid field of a submission, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(BTreeMap<String, Vec<FieldError>>);

impl ValidationErrors {
  pub fn single(field: impl Into<String>, error: FieldError) -> Self {
    let mut errors = Self::default();
    errors.add(field, error);
    errors
  }

  pub fn add(&mut self, field: impl Into<String>, error: FieldError) {
    self.0.entry(field.into()).or_default().push(error);
  }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  pub fn get(&self, field: &str) -> Option<&[FieldError]> {
    self.0.get(field).map(Vec::as_slice)
  }

  pub fn fields(&self) -> impl Iterator<Item = &str> { self.0.keys().map(String::as_str) }
}

impl fmt::Display for ValidationErrors {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut first = true;
    for (field, errors) in &self.0 {
      for e in errors {
        if !first {
          f.write_str("; ")?;
        }
        write!(f, "{field}: {e}")?;
        first = false;
      }
    }
    Ok(())
  }
}

// ─── Validator ───────────────────────────────────────────────────────────────

/// Turns raw JSON submissions into typed [`NewEvent`]s.
#[derive(Debug, Clone)]
pub struct Validator {
  region: country::Id,
}

impl Validator {
  /// `default_region` is an ISO 3166-1 alpha-2 code used for numbers given
  /// without an international prefix.
  pub fn new(default_region: &str) -> Result<Self> {
    let region = default_region
      .to_ascii_uppercase()
      .parse::<country::Id>()
      .map_err(|_| Error::UnknownRegion(default_region.to_owned()))?;
    Ok(Self { region })
  }

  /// Parse, check and normalise a phone number to E.164.
  pub fn normalize_msisdn(&self, raw: &str) -> Result<String, PhoneNumberError> {
    let number = phonenumber::parse(Some(self.region), raw.trim())
      .map_err(|_| PhoneNumberError::ParseError)?;
    let e164 = number.format().mode(Mode::E164).to_string();
    // E.164 caps the whole number at 15 digits, country code included.
    let digits = e164.trim_start_matches('+').len();
    let national = digits.saturating_sub(number.code().value().to_string().len());
    if !(4..=15).contains(&national) || digits > 15 {
      return Err(PhoneNumberError::NotPossible);
    }
    if !phonenumber::is_valid(&number) {
      return Err(PhoneNumberError::NotValid);
    }
    Ok(e164)
  }

  /// Validate a raw submission of the given kind.
  pub fn validate(&self, kind: EventKind, raw: &Value) -> Result<NewEvent, ValidationErrors> {
    let Some(object) = raw.as_object() else {
      return Err(ValidationErrors::single(
        "non_field_errors",
        FieldError::InvalidType { expected: "a JSON object" },
      ));
    };
    let mut f = Fields::new(object);

    let contact_key = f.msisdn("msisdn", self);
    let source = f.required_string("source");
    let deduplication_key = f.string("deduplication_id");
    let timestamp = f.timestamp("timestamp");
    let extension_map = f.object("data");

    let value = match kind {
      EventKind::Triage => triage(&mut f),
      EventKind::TbCheck => tb_check(&mut f),
      EventKind::SelfSwabTest => self_swab_test(&mut f),
      EventKind::VaccineRegistration => vaccine_registration(&mut f),
    };

    f.finish()?;
    match (contact_key, source, value) {
      (Some(contact_key), Some(source), Some(value)) => Ok(NewEvent {
        deduplication_key: deduplication_key
          .filter(|k| !k.is_empty())
          .unwrap_or_else(|| Uuid::new_v4().to_string()),
        contact_key,
        source,
        value,
        extension_map,
        timestamp: timestamp.unwrap_or_else(Utc::now),
        created_by: None,
      }),
      _ => Err(ValidationErrors::single("non_field_errors", FieldError::Missing)),
    }
  }
}

fn triage(f: &mut Fields<'_>) -> Option<EventValue> {
  let risk = f.required_choice("risk");
  f.require_one_of(&["location", "city_location"]);
  let value = TriageValue {
    province:              f.string("province"),
    city:                  f.string("city"),
    age:                   f.choice("age"),
    gender:                f.choice("gender"),
    fever:                 f.boolean("fever"),
    cough:                 f.boolean("cough"),
    sore_throat:           f.boolean("sore_throat"),
    difficulty_breathing:  f.boolean("difficulty_breathing"),
    muscle_pain:           f.boolean("muscle_pain"),
    smell:                 f.boolean("smell"),
    preexisting_condition: f.choice("preexisting_condition"),
    exposure:              f.choice("exposure"),
    tracing:               f.boolean("tracing"),
    location:              f.coordinate("location"),
    city_location:         f.coordinate("city_location"),
    language:              f.string("language"),
    risk:                  risk?,
  };
  Some(EventValue::Triage(value))
}

fn tb_check(f: &mut Fields<'_>) -> Option<EventValue> {
  let risk = f.required_choice("risk");
  f.require_one_of(&["location", "city_location"]);
  let value = TbCheckValue {
    province:         f.string("province"),
    city:             f.string("city"),
    age:              f.choice("age"),
    gender:           f.choice("gender"),
    cough:            f.boolean("cough"),
    fever:            f.boolean("fever"),
    sweat:            f.boolean("sweat"),
    weight:           f.boolean("weight"),
    exposure:         f.choice("exposure"),
    tracing:          f.boolean("tracing"),
    location:         f.coordinate("location"),
    city_location:    f.coordinate("city_location"),
    follow_up_optin:  f.boolean("follow_up_optin"),
    language:         f.string("language"),
    research_consent: f.boolean("research_consent"),
    activation:       f.string("activation"),
    group_arm:        None,
    risk:             risk?,
  };
  Some(EventValue::TbCheck(value))
}

fn self_swab_test(f: &mut Fields<'_>) -> Option<EventValue> {
  let barcode = f.required_string("barcode");
  let result = f.required_choice("result");
  let collection_timestamp = f.timestamp("collection_timestamp");
  Some(EventValue::SelfSwabTest(SelfSwabTestValue {
    barcode: barcode?,
    result: result?,
    collection_timestamp,
  }))
}

fn vaccine_registration(f: &mut Fields<'_>) -> Option<EventValue> {
  let value = VaccineRegistrationValue {
    first_name:    f.string("first_name"),
    last_name:     f.string("last_name"),
    date_of_birth: f.date("date_of_birth"),
    gender:        f.choice("gender"),
    province:      f.string("province"),
    city:          f.string("city"),
    city_location: f.coordinate("city_location"),
    language:      f.string("language"),
    medical_aid:   f.boolean("medical_aid"),
  };
  f.require_one_of(&["province", "city_location"]);
  Some(EventValue::VaccineRegistration(value))
}

// ─── Field reader ────────────────────────────────────────────────────────────

/// Reads typed fields out of a JSON object, recording every failure instead
/// of returning early.
struct Fields<'a> {
  raw:    &'a Map<String, Value>,
  errors: ValidationErrors,
}

impl<'a> Fields<'a> {
  fn new(raw: &'a Map<String, Value>) -> Self {
    Self { raw, errors: ValidationErrors::default() }
  }

  fn finish(self) -> Result<(), ValidationErrors> {
    if self.errors.is_empty() { Ok(()) } else { Err(self.errors) }
  }

  /// `null` is treated the same as an absent key.
  fn get(&self, key: &str) -> Option<&'a Value> {
    self.raw.get(key).filter(|v| !v.is_null())
  }

  fn is_absent(&self, key: &str) -> bool {
    match self.get(key) {
      None => true,
      Some(Value::String(s)) => s.trim().is_empty(),
      Some(_) => false,
    }
  }

  fn fail(&mut self, key: &str, error: FieldError) { self.errors.add(key, error); }

  fn require_one_of(&mut self, keys: &'static [&'static str]) {
    if keys.iter().all(|k| self.is_absent(k)) {
      self.fail(keys[0], FieldError::MissingLocation(match keys {
        ["province", ..] => "province or city_location",
        _ => "location or city_location",
      }));
    }
  }

  fn string(&mut self, key: &str) -> Option<String> {
    match self.get(key)? {
      Value::String(s) => Some(s.trim().to_owned()),
      _ => {
        self.fail(key, FieldError::InvalidType { expected: "a string" });
        None
      }
    }
  }

  fn required_string(&mut self, key: &str) -> Option<String> {
    match self.string(key) {
      Some(s) if !s.is_empty() => Some(s),
      Some(_) => {
        self.fail(key, FieldError::Missing);
        None
      }
      None => {
        if self.get(key).is_none() {
          self.fail(key, FieldError::Missing);
        }
        None
      }
    }
  }

  fn boolean(&mut self, key: &str) -> Option<bool> {
    match self.get(key)? {
      Value::Bool(b) => Some(*b),
      _ => {
        self.fail(key, FieldError::InvalidType { expected: "a boolean" });
        None
      }
    }
  }

  fn choice<T: FromStr>(&mut self, key: &str) -> Option<T> {
    let s = self.string(key)?;
    if s.is_empty() {
      return None;
    }
    match s.parse() {
      Ok(v) => Some(v),
      Err(_) => {
        self.fail(key, FieldError::InvalidEnum { field: key.to_owned(), value: s });
        None
      }
    }
  }

  fn required_choice<T: FromStr>(&mut self, key: &str) -> Option<T> {
    if self.is_absent(key) {
      self.fail(key, FieldError::Missing);
      return None;
    }
    self.choice(key)
  }

  fn coordinate(&mut self, key: &str) -> Option<Coordinate> {
    let s = self.string(key)?;
    if s.is_empty() {
      return None;
    }
    match s.parse() {
      Ok(c) => Some(c),
      Err(_) => {
        self.fail(key, FieldError::InvalidCoordinate);
        None
      }
    }
  }

  fn timestamp(&mut self, key: &str) -> Option<DateTime<Utc>> {
    let s = self.string(key)?;
    match DateTime::parse_from_rfc3339(&s) {
      Ok(dt) => Some(dt.with_timezone(&Utc)),
      Err(e) => {
        self.fail(key, FieldError::InvalidDate(e.to_string()));
        None
      }
    }
  }

  fn date(&mut self, key: &str) -> Option<NaiveDate> {
    let s = self.string(key)?;
    match NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
      Ok(d) => Some(d),
      Err(e) => {
        self.fail(key, FieldError::InvalidDate(e.to_string()));
        None
      }
    }
  }

  fn object(&mut self, key: &str) -> ExtensionMap {
    match self.get(key) {
      None => ExtensionMap::new(),
      Some(Value::Object(map)) => map.clone(),
      Some(_) => {
        self.fail(key, FieldError::InvalidType { expected: "an object" });
        ExtensionMap::new()
      }
    }
  }

  fn msisdn(&mut self, key: &str, validator: &Validator) -> Option<String> {
    let raw = self.required_string(key)?;
    match validator.normalize_msisdn(&raw) {
      Ok(e164) => Some(e164),
      Err(reason) => {
        self.fail(key, FieldError::InvalidPhoneNumber { reason });
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::event::{RiskLevel, SwabResult};

  fn validator() -> Validator { Validator::new("ZA").unwrap() }

  #[test]
  fn normalizes_local_number_to_e164() {
    assert_eq!(validator().normalize_msisdn("0820001001").unwrap(), "+27820001001");
    assert_eq!(validator().normalize_msisdn("+27820001001").unwrap(), "+27820001001");
  }

  #[test]
  fn rejects_unparseable_number() {
    assert_eq!(validator().normalize_msisdn("invalid"), Err(PhoneNumberError::ParseError));
  }

  #[test]
  fn too_short_number_is_not_possible() {
    assert_eq!(validator().normalize_msisdn("123"), Err(PhoneNumberError::NotPossible));
  }

  #[test]
  fn unallocated_prefix_is_not_valid() {
    assert_eq!(validator().normalize_msisdn("+27 99 000 1001"), Err(PhoneNumberError::NotValid));
  }

  #[test]
  fn rejects_unknown_region() {
    assert!(matches!(Validator::new("XX"), Err(Error::UnknownRegion(_))));
  }

  #[test]
  fn valid_triage() {
    let event = validator()
      .validate(
        EventKind::Triage,
        &json!({
          "deduplication_id": "K1",
          "msisdn": "+27820001001",
          "source": "USSD",
          "risk": "low",
          "fever": false,
          "age": "18-40",
          "city_location": "-33.92584+018.42322/",
          "data": { "rooms": 3 },
        }),
      )
      .unwrap();

    assert_eq!(event.deduplication_key, "K1");
    assert_eq!(event.contact_key, "+27820001001");
    assert_eq!(event.extension_map.get("rooms"), Some(&json!(3)));
    let EventValue::Triage(v) = event.value else { panic!("wrong kind") };
    assert_eq!(v.risk, RiskLevel::Low);
    assert_eq!(v.fever, Some(false));
    assert_eq!(v.cough, None);
  }

  #[test]
  fn generates_deduplication_key_when_absent() {
    let raw = json!({
      "msisdn": "0820001001",
      "source": "web",
      "barcode": "CP1",
      "result": "positive",
    });
    let a = validator().validate(EventKind::SelfSwabTest, &raw).unwrap();
    let b = validator().validate(EventKind::SelfSwabTest, &raw).unwrap();
    assert_ne!(a.deduplication_key, b.deduplication_key);
    assert!(matches!(
      a.value,
      EventValue::SelfSwabTest(SelfSwabTestValue { result: SwabResult::Positive, .. })
    ));
  }

  #[test]
  fn collects_every_invalid_field() {
    let errors = validator()
      .validate(
        EventKind::Triage,
        &json!({
          "msisdn": "invalid",
          "source": "USSD",
          "risk": "extreme",
          "gender": "unknown",
          "fever": "yes",
          "location": "somewhere",
        }),
      )
      .unwrap_err();

    let fields: Vec<&str> = errors.fields().collect();
    assert_eq!(fields, ["fever", "gender", "location", "msisdn", "risk"]);
    assert_eq!(
      errors.get("msisdn"),
      Some(&[FieldError::InvalidPhoneNumber { reason: PhoneNumberError::ParseError }][..])
    );
    assert_eq!(
      errors.get("risk"),
      Some(&[FieldError::InvalidEnum { field: "risk".into(), value: "extreme".into() }][..])
    );
  }

  #[test]
  fn missing_location_is_reported() {
    let errors = validator()
      .validate(
        EventKind::TbCheck,
        &json!({ "msisdn": "+27821110000", "source": "WhatsApp", "risk": "low" }),
      )
      .unwrap_err();
    assert!(matches!(errors.get("location"), Some([FieldError::MissingLocation(_)])));
  }

  #[test]
  fn invalid_location_does_not_also_report_missing() {
    let errors = validator()
      .validate(
        EventKind::TbCheck,
        &json!({
          "msisdn": "+27821110000",
          "source": "WhatsApp",
          "risk": "low",
          "location": "nowhere",
        }),
      )
      .unwrap_err();
    assert_eq!(errors.get("location"), Some(&[FieldError::InvalidCoordinate][..]));
  }

  #[test]
  fn group_arm_is_never_taken_from_input() {
    let event = validator()
      .validate(
        EventKind::TbCheck,
        &json!({
          "msisdn": "+27821110000",
          "source": "WhatsApp",
          "risk": "low",
          "city_location": "-26.20227+028.04363/",
          "group_arm": "soft_commitment",
        }),
      )
      .unwrap();
    let EventValue::TbCheck(v) = event.value else { panic!("wrong kind") };
    assert_eq!(v.group_arm, None);
  }

  #[test]
  fn missing_required_fields() {
    let errors = validator().validate(EventKind::SelfSwabTest, &json!({})).unwrap_err();
    for field in ["msisdn", "source", "barcode", "result"] {
      assert_eq!(errors.get(field), Some(&[FieldError::Missing][..]), "{field}");
    }
  }

  #[test]
  fn non_object_body_is_rejected() {
    let errors = validator().validate(EventKind::Triage, &json!([1, 2])).unwrap_err();
    assert!(errors.get("non_field_errors").is_some());
  }
}
