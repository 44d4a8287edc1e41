//! Integration tests for `SqliteStore` against an in-memory database,
//! including the ingestion service running on top of it.

use std::{sync::Arc, time::Duration};

use chrono::{TimeZone as _, Utc};
use healthcheck_core::{
  Error as CoreError,
  arm::StudyConfig,
  destination::Destination,
  event::{EventKind, EventValue, NewEvent, SelfSwabTestValue, SwabResult},
  merge::replay,
  principal::Principal,
  profile::{Prefilled, Profile, ProfilePatch},
  service::HealthService,
  store::{Cursor, HealthStore, PendingQuery},
  validate::{FieldError, PhoneNumberError, Validator},
};
use serde_json::{Value, json};
use strum::IntoEnumIterator as _;

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn swab(contact: &str, minute: u32) -> NewEvent {
  let mut e = NewEvent::new(
    contact,
    "WhatsApp",
    EventValue::SelfSwabTest(SelfSwabTestValue {
      barcode:              format!("CP{minute:04}"),
      result:               SwabResult::Pending,
      collection_timestamp: None,
    }),
  );
  e.timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 8, minute, 0).unwrap();
  e
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn insert_is_idempotent_per_kind_and_key() {
  let s = store().await;
  let mut first = swab("+27820001001", 0);
  first.deduplication_key = "abc".into();

  let (stored, created) = s.insert_event(first.clone()).await.unwrap();
  assert!(created);

  let mut again = first.clone();
  again.source = "USSD".into();
  let (existing, created) = s.insert_event(again).await.unwrap();
  assert!(!created);
  assert_eq!(existing.event_id, stored.event_id);
  assert_eq!(existing.source, "WhatsApp");
  assert_eq!(s.count_events().await.unwrap(), 1);
}

#[tokio::test]
async fn same_key_different_kind_is_a_new_event() {
  let s = store().await;
  let mut swab_event = swab("+27820001001", 0);
  swab_event.deduplication_key = "shared".into();
  s.insert_event(swab_event).await.unwrap();

  let (_, created) = s
    .insert_event(triage_new_event("+27820001001", "shared"))
    .await
    .unwrap();
  assert!(created);
  assert_eq!(s.count_events().await.unwrap(), 2);
}

#[tokio::test]
async fn concurrent_inserts_create_once() {
  let s = store().await;
  let mut e = swab("+27820001001", 0);
  e.deduplication_key = "race".into();

  let (a, b) = tokio::join!(s.insert_event(e.clone()), s.insert_event(e.clone()));
  let created = [a.unwrap().1, b.unwrap().1];
  assert_eq!(created.iter().filter(|c| **c).count(), 1);
}

#[tokio::test]
async fn event_round_trips_through_storage() {
  let s = store().await;
  let mut e = swab("+27820001001", 3);
  e.extension_map.insert("channel_id".into(), json!(7));
  e.created_by = Some("ussd".into());

  let (stored, _) = s.insert_event(e.clone()).await.unwrap();
  let fetched = s.get_event(stored.event_id).await.unwrap().unwrap();
  assert_eq!(fetched, stored);
  assert_eq!(fetched.value, e.value);
  assert_eq!(fetched.timestamp, e.timestamp);
  assert_eq!(fetched.extension_map.get("channel_id"), Some(&json!(7)));
}

#[tokio::test]
async fn latest_by_contact_respects_kind_and_before() {
  let s = store().await;
  let contact = "+27820001001";
  for minute in [5, 1, 9] {
    s.insert_event(swab(contact, minute)).await.unwrap();
  }
  s.insert_event(swab("+27820002002", 30)).await.unwrap();

  let latest = s
    .find_latest_by_contact(contact, Some(EventKind::SelfSwabTest), None)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(latest.timestamp.format("%M").to_string(), "09");

  let before = Utc.with_ymd_and_hms(2024, 3, 1, 8, 9, 0).unwrap();
  let earlier = s
    .find_latest_by_contact(contact, None, Some(before))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(earlier.timestamp.format("%M").to_string(), "05");

  let none = s
    .find_latest_by_contact(contact, Some(EventKind::Triage), None)
    .await
    .unwrap();
  assert!(none.is_none());
}

#[tokio::test]
async fn list_for_contact_is_oldest_first() {
  let s = store().await;
  for minute in [5, 1, 9] {
    s.insert_event(swab("+27820001001", minute)).await.unwrap();
  }
  let events = s.list_events_for_contact("+27820001001").await.unwrap();
  let minutes: Vec<String> = events.iter().map(|e| e.timestamp.format("%M").to_string()).collect();
  assert_eq!(minutes, ["01", "05", "09"]);
}

// ─── Pending events ──────────────────────────────────────────────────────────

#[tokio::test]
async fn pending_events_page_with_cursor_and_skip_synced() {
  let s = store().await;
  for minute in 0..5 {
    s.insert_event(swab("+27820001001", minute)).await.unwrap();
  }

  let mut query = PendingQuery::new(Destination::Warehouse, 2);
  let page1 = s.find_pending_events(&query).await.unwrap();
  assert_eq!(page1.len(), 2);
  assert!(page1[0].created_at < page1[1].created_at);

  let last = page1.last().unwrap();
  query.after = Some(Cursor { at: last.created_at, key: last.event_id });
  let page2 = s.find_pending_events(&query).await.unwrap();
  assert_eq!(page2.len(), 2);
  assert!(page2[0].created_at > last.created_at);

  s.mark_event_synced(page1[0].event_id, Destination::Warehouse).await.unwrap();
  s.mark_event_synced(page1[0].event_id, Destination::Warehouse).await.unwrap();
  let fresh = s
    .find_pending_events(&PendingQuery::new(Destination::Warehouse, 10))
    .await
    .unwrap();
  assert_eq!(fresh.len(), 4);

  // Sync state is per destination.
  let other = s
    .find_pending_events(&PendingQuery::new(Destination::MessagingProfile, 10))
    .await
    .unwrap();
  assert!(other.is_empty(), "messaging only consumes triage");
}

#[tokio::test]
async fn pending_events_honour_since_and_source() {
  let s = store().await;
  let mut inserted = Vec::new();
  for minute in 0..4 {
    inserted.push(s.insert_event(swab("+27820001001", minute)).await.unwrap().0);
  }
  let mut ussd = swab("+27820001001", 10);
  ussd.source = "USSD".into();
  s.insert_event(ussd).await.unwrap();

  let mut query = PendingQuery::new(Destination::Warehouse, 10);
  query.since = Some(inserted[1].created_at);
  assert_eq!(s.find_pending_events(&query).await.unwrap().len(), 3);

  query.source = Some("WhatsApp".into());
  assert_eq!(s.find_pending_events(&query).await.unwrap().len(), 2);

  query.kind = Some(EventKind::Triage);
  assert!(s.find_pending_events(&query).await.unwrap().is_empty());
}

#[tokio::test]
async fn created_at_follows_insert_order() {
  let s = store().await;
  let mut created = Vec::new();
  for minute in (0..20).rev() {
    created.push(s.insert_event(swab("+27820001001", minute)).await.unwrap().0.created_at);
  }
  assert!(created.windows(2).all(|w| w[0] < w[1]), "{created:?}");
}

#[tokio::test]
async fn backdated_event_scans_after_earlier_inserts() {
  let s = store().await;
  let (recent, _) = s.insert_event(swab("+27820001001", 30)).await.unwrap();
  let (backdated, _) = s.insert_event(swab("+27820001001", 1)).await.unwrap();
  assert!(backdated.timestamp < recent.timestamp);

  let mut query = PendingQuery::new(Destination::Warehouse, 10);
  query.since = Some(recent.created_at);
  let pending = s.find_pending_events(&query).await.unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].event_id, backdated.event_id);
}

// ─── Profiles ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn save_profile_is_compare_and_swap() {
  let s = store().await;
  let mut profile = Profile::new("+27820001001");
  profile.province = Some("ZA-WC".into());

  let v1 = s.save_profile(&profile, None).await.unwrap().unwrap();
  assert_eq!(v1.version, 1);
  assert!(s.save_profile(&profile, None).await.unwrap().is_none(), "row exists");

  let mut edit = v1.clone();
  edit.city = Some("Cape Town".into());
  let v2 = s.save_profile(&edit, Some(1)).await.unwrap().unwrap();
  assert_eq!(v2.version, 2);

  assert!(s.save_profile(&edit, Some(1)).await.unwrap().is_none(), "stale version");

  let stored = s.get_profile("+27820001001").await.unwrap().unwrap();
  assert_eq!(stored, v2);
}

#[tokio::test]
async fn pending_profiles_and_guarded_mark() {
  let s = store().await;
  let mut armed = Profile::new("+27821110000");
  armed.set_sync_flag(Destination::TbFollowup, false);
  let armed = s.save_profile(&armed, None).await.unwrap().unwrap();

  let mut done = Profile::new("+27821110001");
  done.set_sync_flag(Destination::TbFollowup, true);
  s.save_profile(&done, None).await.unwrap();
  s.save_profile(&Profile::new("+27821110002"), None).await.unwrap();

  let pending = s
    .find_pending_profiles(Destination::TbFollowup, None, 10)
    .await
    .unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].contact_key, armed.contact_key);

  // A stale version loses to a concurrent re-arm.
  assert!(!s.mark_profile_synced(&armed.contact_key, Destination::TbFollowup, 99).await.unwrap());
  assert!(
    s.mark_profile_synced(&armed.contact_key, Destination::TbFollowup, armed.version)
      .await
      .unwrap()
  );

  let after = s.get_profile(&armed.contact_key).await.unwrap().unwrap();
  assert_eq!(after.sync_flag(Destination::TbFollowup), Some(true));
  assert_eq!(after.version, armed.version + 1);
  assert!(
    s.find_pending_profiles(Destination::TbFollowup, None, 10)
      .await
      .unwrap()
      .is_empty()
  );
}

#[tokio::test]
async fn count_group_arm_requires_consent_and_activation() {
  let s = store().await;
  for (i, (consent, activation, arm)) in [
    (Some(true), "tb_study_a", "control"),
    (Some(true), "tb_study_a", "control"),
    (Some(false), "tb_study_a", "control"),
    (Some(true), "other", "control"),
    (Some(true), "tb_study_a", "planning_prompt"),
  ]
  .into_iter()
  .enumerate()
  {
    let mut p = Profile::new(format!("+2782111000{i}"));
    p.research_consent = consent;
    p.activation = Some(activation.into());
    p.group_arm = Some(arm.into());
    s.save_profile(&p, None).await.unwrap();
  }
  assert_eq!(s.count_group_arm("control", "tb_study_a").await.unwrap(), 2);
  assert_eq!(s.count_group_arm("planning_prompt", "tb_study_a").await.unwrap(), 1);
}

// ─── Locks and marks ─────────────────────────────────────────────────────────

#[tokio::test]
async fn lock_is_exclusive_until_released_or_expired() {
  let s = store().await;
  let ttl = Duration::from_secs(60);
  assert!(s.try_acquire_lock("warehouse", "a", ttl).await.unwrap());
  assert!(!s.try_acquire_lock("warehouse", "b", ttl).await.unwrap());
  assert!(s.try_acquire_lock("tb_followup", "b", ttl).await.unwrap());

  // Only the holder can release.
  s.release_lock("warehouse", "b").await.unwrap();
  assert!(!s.try_acquire_lock("warehouse", "b", ttl).await.unwrap());
  s.release_lock("warehouse", "a").await.unwrap();
  assert!(s.try_acquire_lock("warehouse", "b", ttl).await.unwrap());

  // An expired lock is taken over.
  assert!(s.try_acquire_lock("messaging_profile", "a", Duration::ZERO).await.unwrap());
  assert!(s.try_acquire_lock("messaging_profile", "b", ttl).await.unwrap());
}

#[tokio::test]
async fn high_water_marks_only_move_forward() {
  let s = store().await;
  assert!(s.get_high_water_mark("warehouse:triage").await.unwrap().is_none());

  let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
  let t0 = Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap();
  s.set_high_water_mark("warehouse:triage", t1).await.unwrap();
  s.set_high_water_mark("warehouse:triage", t0).await.unwrap();
  assert_eq!(s.get_high_water_mark("warehouse:triage").await.unwrap(), Some(t1));
}

// ─── Ingestion service ───────────────────────────────────────────────────────

fn principal() -> Principal {
  let mut permissions: Vec<String> = EventKind::iter()
    .flat_map(|k| [format!("add_{k}"), format!("view_{k}")])
    .collect();
  permissions.extend(["view_profile".into(), "change_profile".into()]);
  Principal::new("ussd", permissions)
}

fn service(s: &SqliteStore, study: Option<StudyConfig>) -> HealthService<SqliteStore> {
  HealthService::new(Arc::new(s.clone()), Validator::new("ZA").unwrap(), study)
}

fn triage_body(msisdn: &str, dedup: &str, fever: bool) -> Value {
  json!({
    "deduplication_id": dedup,
    "msisdn": msisdn,
    "source": "USSD",
    "province": "ZA-WC",
    "city": "Cape Town",
    "age": "18-40",
    "fever": fever,
    "cough": false,
    "sore_throat": false,
    "exposure": "no",
    "tracing": true,
    "risk": "low",
    "city_location": "-33.92487+018.42406/",
  })
}

fn triage_new_event(contact: &str, dedup: &str) -> NewEvent {
  let validator = Validator::new("ZA").unwrap();
  validator
    .validate(EventKind::Triage, &triage_body(contact, dedup, false))
    .unwrap()
}

fn tb_body(msisdn: &str, dedup: &str) -> Value {
  json!({
    "deduplication_id": dedup,
    "msisdn": msisdn,
    "source": "WhatsApp",
    "province": "ZA-GT",
    "city": "Johannesburg",
    "age": "18-40",
    "gender": "female",
    "cough": true,
    "fever": false,
    "sweat": false,
    "weight": false,
    "exposure": "not_sure",
    "tracing": true,
    "risk": "moderate",
    "location": "-26.20227+028.04363/",
    "follow_up_optin": true,
    "language": "eng",
    "research_consent": true,
    "activation": "tb_study_a",
  })
}

#[tokio::test]
async fn triage_submission_and_resubmission() {
  let s = store().await;
  let svc = service(&s, None);

  let first = svc
    .submit_event(EventKind::Triage, &triage_body("0820001001", "k1", false), &principal())
    .await
    .unwrap();
  assert!(first.created);
  assert_eq!(first.event.contact_key, "+27820001001");
  assert_eq!(first.event.created_by.as_deref(), Some("ussd"));
  assert_eq!(first.event.value.classification(), Some("low"));

  let profile = s.get_profile("+27820001001").await.unwrap().unwrap();
  assert_eq!(profile.extension_map.get("fever"), Some(&json!(false)));
  assert_eq!(profile.extension_map.get("risk"), Some(&json!("low")));
  assert_eq!(profile.province.as_deref(), Some("ZA-WC"));
  assert_eq!(profile.version, 1);

  let second = svc
    .submit_event(EventKind::Triage, &triage_body("+27820001001", "k1", true), &principal())
    .await
    .unwrap();
  assert!(!second.created);
  assert_eq!(second.event.event_id, first.event.event_id);
  assert_eq!(s.count_events().await.unwrap(), 1);

  let unchanged = s.get_profile("+27820001001").await.unwrap().unwrap();
  assert_eq!(unchanged, profile);
}

#[tokio::test]
async fn later_false_answer_overwrites_true() {
  let s = store().await;
  let svc = service(&s, None);
  for (dedup, fever) in [("a", true), ("b", false)] {
    svc
      .submit_event(EventKind::Triage, &triage_body("+27820001001", dedup, fever), &principal())
      .await
      .unwrap();
  }
  let profile = s.get_profile("+27820001001").await.unwrap().unwrap();
  assert_eq!(profile.extension_map.get("fever"), Some(&json!(false)));
  assert_eq!(profile.version, 2);
}

#[tokio::test]
async fn invalid_msisdn_stores_nothing() {
  let s = store().await;
  let svc = service(&s, None);
  let err = svc
    .submit_event(EventKind::Triage, &triage_body("invalid", "k", false), &principal())
    .await
    .unwrap_err();

  let CoreError::Validation(errors) = err else {
    panic!("expected validation error, got {err:?}");
  };
  assert_eq!(
    errors.get("msisdn"),
    Some(&[FieldError::InvalidPhoneNumber { reason: PhoneNumberError::ParseError }][..])
  );
  assert_eq!(s.count_events().await.unwrap(), 0);
}

#[tokio::test]
async fn missing_permission_is_forbidden() {
  let s = store().await;
  let svc = service(&s, None);
  let nobody = Principal::new("nobody", Vec::<String>::new());
  let err = svc
    .submit_event(EventKind::Triage, &triage_body("+27820001001", "k", false), &nobody)
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::Forbidden(_)));
  assert_eq!(s.count_events().await.unwrap(), 0);
}

#[tokio::test]
async fn tb_check_rearms_follow_up_and_assigns_arm_once() {
  let s = store().await;
  let study = StudyConfig {
    activation: "tb_study_a".into(),
    arms:       vec!["control".into(), "health_literacy".into()],
    limit:      Some(0),
  };
  let svc = service(&s, Some(study));

  let first = svc
    .submit_event(EventKind::TbCheck, &tb_body("+27821110000", "tb1"), &principal())
    .await
    .unwrap();
  let EventValue::TbCheck(check) = &first.event.value else {
    panic!("expected a TB check");
  };
  assert_eq!(check.group_arm.as_deref(), Some("control"));

  let profile = s.get_profile("+27821110000").await.unwrap().unwrap();
  assert_eq!(profile.sync_flag(Destination::TbFollowup), Some(false));
  assert_eq!(profile.extension_map.get("follow_up_optin"), Some(&json!(true)));
  assert_eq!(profile.group_arm.as_deref(), Some("control"));

  s.mark_profile_synced("+27821110000", Destination::TbFollowup, profile.version)
    .await
    .unwrap();

  let second = svc
    .submit_event(EventKind::TbCheck, &tb_body("+27821110000", "tb2"), &principal())
    .await
    .unwrap();
  let EventValue::TbCheck(check) = &second.event.value else {
    panic!("expected a TB check");
  };
  assert_eq!(check.group_arm, None, "already enrolled");

  let profile = s.get_profile("+27821110000").await.unwrap().unwrap();
  assert_eq!(profile.sync_flag(Destination::TbFollowup), Some(false), "re-armed");
  assert_eq!(profile.group_arm.as_deref(), Some("control"));
}

#[tokio::test]
async fn full_arms_are_skipped_on_ingestion() {
  let s = store().await;
  let mut enrolled = Profile::new("+27821119999");
  enrolled.research_consent = Some(true);
  enrolled.activation = Some("tb_study_a".into());
  enrolled.group_arm = Some("control".into());
  s.save_profile(&enrolled, None).await.unwrap();

  let study = StudyConfig {
    activation: "tb_study_a".into(),
    arms:       vec!["control".into(), "health_literacy".into()],
    limit:      Some(1),
  };
  let svc = service(&s, Some(study));
  let submitted = svc
    .submit_event(EventKind::TbCheck, &tb_body("+27821110000", "tb1"), &principal())
    .await
    .unwrap();
  let EventValue::TbCheck(check) = &submitted.event.value else {
    panic!("expected a TB check");
  };
  assert_eq!(check.group_arm.as_deref(), Some("health_literacy"));
}

#[tokio::test]
async fn prefill_reconstructs_without_persisting() {
  let s = store().await;
  let svc = service(&s, None);
  let contact = "+27820001001";
  assert_eq!(svc.get_or_prefill(contact).await.unwrap(), Prefilled::NotFound);

  // Events written behind the service's back.
  s.insert_event(triage_new_event(contact, "x")).await.unwrap();
  s.insert_event(swab(contact, 1)).await.unwrap();

  let Prefilled::Reconstructed(profile) = svc.get_or_prefill(contact).await.unwrap() else {
    panic!("expected a reconstructed profile");
  };
  assert_eq!(profile.province.as_deref(), Some("ZA-WC"));
  assert_eq!(profile.extension_map.get("self_swab_result"), Some(&json!("pending")));
  assert!(s.get_profile(contact).await.unwrap().is_none());
}

#[tokio::test]
async fn replay_matches_persisted_profile() {
  let s = store().await;
  let svc = service(&s, None);
  let contact = "+27820001001";
  svc
    .submit_event(EventKind::Triage, &triage_body(contact, "a", true), &principal())
    .await
    .unwrap();
  svc
    .submit_event(EventKind::Triage, &triage_body(contact, "b", false), &principal())
    .await
    .unwrap();

  let stored = s.get_profile(contact).await.unwrap().unwrap();
  let events = s.list_events_for_contact(contact).await.unwrap();
  let mut rebuilt = replay(contact, &events).unwrap();
  rebuilt.version = stored.version;
  rebuilt.updated_at = stored.updated_at;
  assert_eq!(rebuilt, stored);
}

#[tokio::test]
async fn patch_accretes_extension_and_checks_precondition() {
  let s = store().await;
  let svc = service(&s, None);
  let contact = "+27820001001";
  let mut profile = Profile::new(contact);
  profile.extension_map.insert("b".into(), json!(2));
  s.save_profile(&profile, None).await.unwrap();

  let patch: ProfilePatch = serde_json::from_value(json!({ "data": { "a": 1 } })).unwrap();
  let err = svc
    .patch_profile(contact, patch.clone(), &principal(), |_| false)
    .await
    .unwrap_err();
  assert!(matches!(err, CoreError::PreconditionFailed));

  let patched = svc
    .patch_profile(contact, patch, &principal(), |p| p.version == 1)
    .await
    .unwrap();
  assert_eq!(patched.extension_map.get("a"), Some(&json!(1)));
  assert_eq!(patched.extension_map.get("b"), Some(&json!(2)));
  assert_eq!(patched.version, 2);

  let missing = svc
    .patch_profile("+27820009999", ProfilePatch::default(), &principal(), |_| true)
    .await
    .unwrap_err();
  assert!(matches!(missing, CoreError::NotFound(_)));
}

#[tokio::test]
async fn latest_event_lookup() {
  let s = store().await;
  let svc = service(&s, None);
  svc
    .submit_event(EventKind::Triage, &triage_body("+27820001001", "a", true), &principal())
    .await
    .unwrap();

  let latest = svc
    .latest_event(EventKind::Triage, "+27820001001", &principal())
    .await
    .unwrap();
  assert_eq!(latest.value.kind(), EventKind::Triage);

  let missing = svc
    .latest_event(EventKind::TbCheck, "+27820001001", &principal())
    .await
    .unwrap_err();
  assert!(matches!(missing, CoreError::NotFound(_)));
}
