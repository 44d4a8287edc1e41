//! The merge engine: folds an event into a profile.
//!
//! Rule: a field is overwritten when the event's value *has a value*, and left
//! alone otherwise. Only null/None and the empty string count as "no value";
//! `false` and `0` are real answers and do overwrite.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use strum::IntoEnumIterator as _;

use crate::{
  destination::Destination,
  event::{AgeGroup, Answer, Event, EventValue, ExtensionMap, Gender, RiskLevel, SwabResult},
  geo::Coordinate,
  profile::Profile,
};

// ─── HasValue ────────────────────────────────────────────────────────────────

pub trait HasValue {
  fn has_value(&self) -> bool;
}

impl HasValue for str {
  fn has_value(&self) -> bool { !self.is_empty() }
}

impl HasValue for String {
  fn has_value(&self) -> bool { !self.is_empty() }
}

impl HasValue for Value {
  fn has_value(&self) -> bool {
    match self {
      Value::Null => false,
      Value::String(s) => !s.is_empty(),
      _ => true,
    }
  }
}

impl<T: HasValue> HasValue for Option<T> {
  fn has_value(&self) -> bool { self.as_ref().is_some_and(HasValue::has_value) }
}

macro_rules! always_has_value {
  ($($t:ty),* $(,)?) => {
    $( impl HasValue for $t { fn has_value(&self) -> bool { true } } )*
  };
}

always_has_value!(
  bool,
  i64,
  f64,
  NaiveDate,
  DateTime<Utc>,
  Coordinate,
  AgeGroup,
  Gender,
  Answer,
  RiskLevel,
  SwabResult,
);

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn overwrite<T: HasValue + Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
  if incoming.has_value() {
    slot.clone_from(incoming);
  }
}

/// Copy a typed event answer into the profile extension map.
fn put<T: HasValue + Serialize>(extension: &mut ExtensionMap, key: &str, incoming: &T) {
  if !incoming.has_value() {
    return;
  }
  match serde_json::to_value(incoming) {
    Ok(value) if value.has_value() => {
      extension.insert(key.to_owned(), value);
    }
    _ => {}
  }
}

// ─── Merge ───────────────────────────────────────────────────────────────────

/// Fold `event` into `profile` and return the updated profile.
///
/// Application order: the event's free-form extension map, then its typed
/// fields, then sync-flag re-arming, so neither free-form data nor typed
/// fields can clear a re-armed flag.
pub fn merge(mut profile: Profile, event: &Event) -> Profile {
  for (key, value) in &event.extension_map {
    if value.has_value() {
      profile.extension_map.insert(key.clone(), value.clone());
    }
  }

  match &event.value {
    EventValue::Triage(v) => {
      overwrite(&mut profile.province, &v.province);
      overwrite(&mut profile.city, &v.city);
      overwrite(&mut profile.age, &v.age);
      overwrite(&mut profile.gender, &v.gender);
      overwrite(&mut profile.location, &v.location);
      overwrite(&mut profile.city_location, &v.city_location);
      overwrite(&mut profile.language, &v.language);
      overwrite(&mut profile.preexisting_condition, &v.preexisting_condition);

      let ext = &mut profile.extension_map;
      put(ext, "fever", &v.fever);
      put(ext, "cough", &v.cough);
      put(ext, "sore_throat", &v.sore_throat);
      put(ext, "difficulty_breathing", &v.difficulty_breathing);
      put(ext, "muscle_pain", &v.muscle_pain);
      put(ext, "smell", &v.smell);
      put(ext, "exposure", &v.exposure);
      put(ext, "tracing", &v.tracing);
      put(ext, "risk", &v.risk);
    }
    EventValue::TbCheck(v) => {
      overwrite(&mut profile.province, &v.province);
      overwrite(&mut profile.city, &v.city);
      overwrite(&mut profile.age, &v.age);
      overwrite(&mut profile.gender, &v.gender);
      overwrite(&mut profile.location, &v.location);
      overwrite(&mut profile.city_location, &v.city_location);
      overwrite(&mut profile.language, &v.language);
      overwrite(&mut profile.research_consent, &v.research_consent);
      overwrite(&mut profile.activation, &v.activation);
      if profile.group_arm.is_none() {
        overwrite(&mut profile.group_arm, &v.group_arm);
      }

      let ext = &mut profile.extension_map;
      put(ext, "cough", &v.cough);
      put(ext, "fever", &v.fever);
      put(ext, "sweat", &v.sweat);
      put(ext, "weight", &v.weight);
      put(ext, "exposure", &v.exposure);
      put(ext, "tracing", &v.tracing);
      put(ext, "tb_risk", &v.risk);
      put(ext, "follow_up_optin", &v.follow_up_optin);
    }
    EventValue::SelfSwabTest(v) => {
      let ext = &mut profile.extension_map;
      put(ext, "self_swab_barcode", &v.barcode);
      put(ext, "self_swab_result", &v.result);
      put(ext, "self_swab_timestamp", &v.collection_timestamp);
    }
    EventValue::VaccineRegistration(v) => {
      overwrite(&mut profile.first_name, &v.first_name);
      overwrite(&mut profile.last_name, &v.last_name);
      overwrite(&mut profile.date_of_birth, &v.date_of_birth);
      overwrite(&mut profile.gender, &v.gender);
      overwrite(&mut profile.province, &v.province);
      overwrite(&mut profile.city, &v.city);
      overwrite(&mut profile.city_location, &v.city_location);
      overwrite(&mut profile.language, &v.language);
      put(&mut profile.extension_map, "medical_aid", &v.medical_aid);
    }
  }

  let kind = event.kind();
  for destination in Destination::iter() {
    if destination.rearmed_by().contains(&kind) {
      profile.set_sync_flag(destination, false);
    }
  }

  profile
}

/// Rebuild a profile from a contact's event history, oldest first.
///
/// Returns `None` when `events` is empty.
pub fn replay<'a>(
  contact_key: &str,
  events: impl IntoIterator<Item = &'a Event>,
) -> Option<Profile> {
  let mut events: Vec<&Event> = events.into_iter().collect();
  if events.is_empty() {
    return None;
  }
  events.sort_by(|a, b| {
    a.timestamp
      .cmp(&b.timestamp)
      .then(a.created_at.cmp(&b.created_at))
  });
  Some(
    events
      .into_iter()
      .fold(Profile::new(contact_key), merge),
  )
}
