//! Ingestion and profile operations shared by the HTTP layer and tooling.

use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use serde_json::Value;

use crate::{
  Error, Result,
  arm::{self, StudyConfig},
  event::{Event, EventKind, EventValue, TbCheckValue},
  merge::{merge, replay},
  principal::{Principal, permission},
  profile::{Prefilled, Profile, ProfilePatch},
  store::HealthStore,
  validate::Validator,
};

/// Compare-and-swap attempts before a profile write gives up.
const SAVE_ATTEMPTS: usize = 5;

/// The result of [`HealthService::submit_event`].
#[derive(Debug, Clone, Serialize)]
pub struct Submitted {
  /// `false` when the deduplication key had already been seen.
  pub created: bool,
  #[serde(rename = "record")]
  pub event:   Event,
}

pub struct HealthService<S> {
  store:     Arc<S>,
  validator: Validator,
  study:     Option<StudyConfig>,
}

impl<S> Clone for HealthService<S> {
  fn clone(&self) -> Self {
    Self {
      store:     Arc::clone(&self.store),
      validator: self.validator.clone(),
      study:     self.study.clone(),
    }
  }
}

impl<S: HealthStore> HealthService<S> {
  pub fn new(store: Arc<S>, validator: Validator, study: Option<StudyConfig>) -> Self {
    Self { store, validator, study }
  }

  pub fn store(&self) -> &Arc<S> { &self.store }

  pub fn validator(&self) -> &Validator { &self.validator }

  // ── Events ────────────────────────────────────────────────────────────

  /// Validate, deduplicate and persist a submission, then fold it into the
  /// contact's profile.
  ///
  /// A repeated deduplication key returns the stored event with
  /// `created = false` and leaves the profile untouched.
  pub async fn submit_event(
    &self,
    kind: EventKind,
    raw: &Value,
    principal: &Principal,
  ) -> Result<Submitted> {
    principal.require(&permission::add(kind))?;

    let mut new = self.validator.validate(kind, raw)?;
    new.created_by = Some(principal.username.clone());
    if let EventValue::TbCheck(check) = &mut new.value {
      self.assign_arm(&new.contact_key, check).await?;
    }

    let (event, created) = self.store.insert_event(new).await.map_err(Error::store)?;
    if created {
      self.merge_into_profile(&event).await?;
    }
    Ok(Submitted { created, event })
  }

  /// The contact's most recent event of `kind`.
  pub async fn latest_event(
    &self,
    kind: EventKind,
    contact_key: &str,
    principal: &Principal,
  ) -> Result<Event> {
    principal.require(&permission::view(kind))?;
    self
      .store
      .find_latest_by_contact(contact_key, Some(kind), None)
      .await
      .map_err(Error::store)?
      .ok_or_else(|| Error::NotFound(format!("{kind} for {contact_key}")))
  }

  async fn assign_arm(&self, contact_key: &str, check: &mut TbCheckValue) -> Result<()> {
    check.group_arm = None;
    let Some(study) = &self.study else {
      return Ok(());
    };
    let profile = self.store.get_profile(contact_key).await.map_err(Error::store)?;
    if !arm::eligible(study, profile.as_ref(), check) {
      return Ok(());
    }

    let mut counts = HashMap::new();
    if study.limit.is_some_and(|limit| limit > 0) {
      for name in &study.arms {
        let n = self
          .store
          .count_group_arm(name, &study.activation)
          .await
          .map_err(Error::store)?;
        counts.insert(name.clone(), n);
      }
    }
    check.group_arm = arm::draw_arm(study, &counts, &mut rand::thread_rng());
    Ok(())
  }

  async fn merge_into_profile(&self, event: &Event) -> Result<Profile> {
    let contact_key = event.contact_key.as_str();
    for _ in 0..SAVE_ATTEMPTS {
      let (merged, expected) = match self.store.get_profile(contact_key).await.map_err(Error::store)? {
        Some(current) => {
          let version = current.version;
          (merge(current, event), Some(version))
        }
        // First write for this contact: rebuild from the full history, which
        // already includes `event`.
        None => {
          let history = self
            .store
            .list_events_for_contact(contact_key)
            .await
            .map_err(Error::store)?;
          let profile = replay(contact_key, &history)
            .unwrap_or_else(|| merge(Profile::new(contact_key), event));
          (profile, None)
        }
      };

      if let Some(saved) = self.store.save_profile(&merged, expected).await.map_err(Error::store)? {
        return Ok(saved);
      }
    }
    Err(Error::Conflict(format!("profile {contact_key} kept changing")))
  }

  // ── Profiles ──────────────────────────────────────────────────────────

  /// The stored profile, or one rebuilt from the event history. Never
  /// persists anything.
  pub async fn get_or_prefill(&self, contact_key: &str) -> Result<Prefilled> {
    if let Some(profile) = self.store.get_profile(contact_key).await.map_err(Error::store)? {
      return Ok(Prefilled::Stored(profile));
    }
    let history = self
      .store
      .list_events_for_contact(contact_key)
      .await
      .map_err(Error::store)?;
    Ok(match replay(contact_key, &history) {
      Some(profile) => Prefilled::Reconstructed(profile),
      None => Prefilled::NotFound,
    })
  }

  pub async fn get_profile(&self, contact_key: &str, principal: &Principal) -> Result<Profile> {
    principal.require(permission::VIEW_PROFILE)?;
    self
      .get_or_prefill(contact_key)
      .await?
      .into_profile()
      .ok_or_else(|| Error::NotFound(contact_key.to_owned()))
  }

  /// Apply a partial update.
  ///
  /// `precondition` sees the current profile before every attempt; returning
  /// `false` aborts with [`Error::PreconditionFailed`].
  pub async fn patch_profile<F>(
    &self,
    contact_key: &str,
    patch: ProfilePatch,
    principal: &Principal,
    precondition: F,
  ) -> Result<Profile>
  where
    F: Fn(&Profile) -> bool + Send,
  {
    principal.require(permission::CHANGE_PROFILE)?;
    for _ in 0..SAVE_ATTEMPTS {
      let (mut profile, expected) = match self.get_or_prefill(contact_key).await? {
        Prefilled::Stored(p) => {
          let version = p.version;
          (p, Some(version))
        }
        Prefilled::Reconstructed(p) => (p, None),
        Prefilled::NotFound => return Err(Error::NotFound(contact_key.to_owned())),
      };
      if !precondition(&profile) {
        return Err(Error::PreconditionFailed);
      }
      profile.apply_patch(patch.clone());

      if let Some(saved) = self.store.save_profile(&profile, expected).await.map_err(Error::store)? {
        return Ok(saved);
      }
    }
    Err(Error::Conflict(format!("profile {contact_key} kept changing")))
  }
}
