//! Profile: the consolidated, current-state record for one contact key.
//!
//! A profile is derived data: it can always be rebuilt by replaying the
//! contact's events through [`crate::merge::merge`]. It is nevertheless
//! persisted on every ingestion so reads stay cheap.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
  destination::Destination,
  event::{AgeGroup, Answer, ExtensionMap, Gender},
  geo::Coordinate,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
  /// E.164 phone number; primary key.
  pub contact_key:           String,
  pub first_name:            Option<String>,
  pub last_name:             Option<String>,
  pub province:              Option<String>,
  pub city:                  Option<String>,
  pub age:                   Option<AgeGroup>,
  pub gender:                Option<Gender>,
  pub date_of_birth:         Option<NaiveDate>,
  pub location:              Option<Coordinate>,
  pub city_location:         Option<Coordinate>,
  pub language:              Option<String>,
  pub preexisting_condition: Option<Answer>,
  pub research_consent:      Option<bool>,
  pub activation:            Option<String>,
  /// Study condition; written once and never reassigned.
  pub group_arm:             Option<String>,
  pub extension_map:         ExtensionMap,
  /// Compare-and-swap counter. `0` means the profile has never been stored.
  #[serde(default)]
  pub version:               i64,
  pub updated_at:            Option<DateTime<Utc>>,
}

impl Profile {
  /// An empty, unsaved profile for `contact_key`.
  pub fn new(contact_key: impl Into<String>) -> Self {
    Self {
      contact_key:           contact_key.into(),
      first_name:            None,
      last_name:             None,
      province:              None,
      city:                  None,
      age:                   None,
      gender:                None,
      date_of_birth:         None,
      location:              None,
      city_location:         None,
      language:              None,
      preexisting_condition: None,
      research_consent:      None,
      activation:            None,
      group_arm:             None,
      extension_map:         ExtensionMap::new(),
      version:               0,
      updated_at:            None,
    }
  }

  /// The profile-level sync flag for `destination`, if that destination
  /// tracks one and it has been set.
  pub fn sync_flag(&self, destination: Destination) -> Option<bool> {
    let key = destination.profile_flag()?;
    self.extension_map.get(key).and_then(Value::as_bool)
  }

  pub fn set_sync_flag(&mut self, destination: Destination, synced: bool) {
    if let Some(key) = destination.profile_flag() {
      self.extension_map.insert(key.to_owned(), Value::Bool(synced));
    }
  }

  /// Apply a partial update: present first-class fields replace the stored
  /// value, extension keys are merged into the existing map.
  pub fn apply_patch(&mut self, patch: ProfilePatch) {
    macro_rules! replace {
      ($($field:ident),* $(,)?) => {
        $( if let Some(v) = patch.$field { self.$field = Some(v); } )*
      };
    }
    replace!(
      first_name,
      last_name,
      province,
      city,
      age,
      gender,
      date_of_birth,
      location,
      city_location,
      language,
      preexisting_condition,
      research_consent,
      activation,
    );
    if let Some(extension) = patch.extension_map {
      self.extension_map.extend(extension);
    }
  }
}

/// Body of a partial profile update.
///
/// `group_arm` is not patchable; arms are only assigned by the study
/// randomisation on ingestion.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilePatch {
  pub first_name:            Option<String>,
  pub last_name:             Option<String>,
  pub province:              Option<String>,
  pub city:                  Option<String>,
  pub age:                   Option<AgeGroup>,
  pub gender:                Option<Gender>,
  pub date_of_birth:         Option<NaiveDate>,
  pub location:              Option<Coordinate>,
  pub city_location:         Option<Coordinate>,
  pub language:              Option<String>,
  pub preexisting_condition: Option<Answer>,
  pub research_consent:      Option<bool>,
  pub activation:            Option<String>,
  #[serde(alias = "data")]
  pub extension_map:         Option<ExtensionMap>,
}

/// The result of [`crate::service::HealthService::get_or_prefill`].
#[derive(Debug, Clone, PartialEq)]
pub enum Prefilled {
  /// A persisted profile row.
  Stored(Profile),
  /// Rebuilt in memory from the event history; not persisted.
  Reconstructed(Profile),
  /// Neither a profile row nor any events exist for the contact.
  NotFound,
}

impl Prefilled {
  pub fn into_profile(self) -> Option<Profile> {
    match self {
      Self::Stored(p) | Self::Reconstructed(p) => Some(p),
      Self::NotFound => None,
    }
  }
}
