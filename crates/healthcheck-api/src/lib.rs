//! JSON REST API for health-check submissions and profiles.
//!
//! Exposes an axum [`Router`] backed by a [`HealthService`] over any
//! [`HealthStore`]. Handlers read the caller from a [`Principal`] request
//! extension; authenticating the request and inserting that extension is the
//! caller's responsibility.
//!
//! # Mounting
//!
//! ```rust,ignore
//! .nest("/api", healthcheck_api::api_router(service.clone()))
//! ```
//!
//! [`Principal`]: healthcheck_core::principal::Principal

pub mod error;
pub mod etag;
pub mod events;
pub mod profiles;

use axum::{
  Router,
  routing::{get, post},
};
use healthcheck_core::{service::HealthService, store::HealthStore};

pub use error::ApiError;

/// Build the API router for `service`.
///
/// The returned router carries its own state; nest it into a parent once the
/// parent's `with_state` has been applied.
pub fn api_router<S>(service: HealthService<S>) -> Router<()>
where
  S: HealthStore + 'static,
{
  Router::new()
    .route("/events/{kind}", post(events::submit::<S>))
    .route("/events/{kind}/latest", get(events::latest::<S>))
    .route(
      "/profiles/{msisdn}",
      get(profiles::get_one::<S>).patch(profiles::patch_one::<S>),
    )
    .with_state(service)
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use axum::{
    Extension,
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
  };
  use healthcheck_core::{
    principal::Principal, service::HealthService, validate::Validator,
  };
  use healthcheck_store_sqlite::SqliteStore;
  use serde_json::{Value, json};
  use tower::ServiceExt as _;

  use super::*;

  async fn make_router(permissions: &[&str]) -> Router {
    let store = SqliteStore::open_in_memory().await.unwrap();
    let service = HealthService::new(Arc::new(store), Validator::new("ZA").unwrap(), None);
    let principal = Principal::new("ussd", permissions.iter().copied());
    api_router(service).layer(Extension(principal))
  }

  async fn full_router() -> Router {
    make_router(&[
      "add_triage",
      "view_triage",
      "add_tb_check",
      "view_profile",
      "change_profile",
    ])
    .await
  }

  async fn send(
    router:  &Router,
    method:  &str,
    uri:     &str,
    headers: Vec<(header::HeaderName, &str)>,
    body:    Option<Value>,
  ) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
      builder = builder.header(k, v);
    }
    let body = match body {
      Some(json) => {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(json.to_string())
      }
      None => Body::empty(),
    };
    router.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
  }

  async fn json_body(resp: Response) -> Value {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
  }

  fn triage(dedup: &str, fever: bool) -> Value {
    json!({
      "deduplication_id": dedup,
      "msisdn": "+27820001001",
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
      "data": { "channel": "ussd" },
    })
  }

  // ── Events ──────────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn submit_returns_201_then_200_for_same_key() {
    let router = full_router().await;

    let first = send(&router, "POST", "/events/triage", vec![], Some(triage("k1", false))).await;
    assert_eq!(first.status(), StatusCode::CREATED);
    let created = json_body(first).await;
    assert_eq!(created["contact_key"], "+27820001001");
    assert_eq!(created["created_by"], "ussd");

    let again = send(&router, "POST", "/events/triage", vec![], Some(triage("k1", true))).await;
    assert_eq!(again.status(), StatusCode::OK);
    let existing = json_body(again).await;
    assert_eq!(existing["event_id"], created["event_id"]);
  }

  #[tokio::test]
  async fn validation_errors_are_400_with_field_map() {
    let router = full_router().await;
    let mut body = triage("k1", false);
    body["msisdn"] = json!("invalid");
    body["age"] = json!("old");

    let resp = send(&router, "POST", "/events/triage", vec![], Some(body)).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let errors = json_body(resp).await;
    assert!(errors["errors"]["msisdn"].is_array());
    assert!(errors["errors"]["age"].is_array());
  }

  #[tokio::test]
  async fn unknown_kind_is_404() {
    let router = full_router().await;
    let resp = send(&router, "POST", "/events/covid_vaccine", vec![], Some(triage("k", true))).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn missing_permission_is_403() {
    let router = make_router(&["view_profile"]).await;
    let resp = send(&router, "POST", "/events/triage", vec![], Some(triage("k", true))).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
  }

  #[tokio::test]
  async fn latest_event_by_msisdn() {
    let router = full_router().await;
    send(&router, "POST", "/events/triage", vec![], Some(triage("k1", true))).await;

    let resp = send(&router, "GET", "/events/triage/latest?msisdn=0820001001", vec![], None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["deduplication_key"], "k1");

    let none = send(&router, "GET", "/events/tb_check/latest?msisdn=0820001001", vec![], None).await;
    assert_eq!(none.status(), StatusCode::FORBIDDEN, "no view_tb_check");
  }

  // ── Profiles ────────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn profile_reflects_submissions_and_has_etag() {
    let router = full_router().await;
    send(&router, "POST", "/events/triage", vec![], Some(triage("a", true))).await;
    send(&router, "POST", "/events/triage", vec![], Some(triage("b", false))).await;

    let resp = send(&router, "GET", "/profiles/+27820001001", vec![], None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key(header::ETAG));
    let profile = json_body(resp).await;
    assert_eq!(profile["extension_map"]["fever"], false);
    assert_eq!(profile["extension_map"]["channel"], "ussd");
    assert_eq!(profile["province"], "ZA-WC");
  }

  #[tokio::test]
  async fn unknown_profile_is_404_and_bad_msisdn_is_400() {
    let router = full_router().await;
    let missing = send(&router, "GET", "/profiles/+27820009999", vec![], None).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let bad = send(&router, "GET", "/profiles/invalid", vec![], None).await;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn patch_honours_if_match() {
    let router = full_router().await;
    send(&router, "POST", "/events/triage", vec![], Some(triage("a", true))).await;

    let current = send(&router, "GET", "/profiles/+27820001001", vec![], None).await;
    let etag = current.headers()[header::ETAG].to_str().unwrap().to_owned();

    let stale = send(
      &router,
      "PATCH",
      "/profiles/+27820001001",
      vec![(header::IF_MATCH, "\"stale\"")],
      Some(json!({ "data": { "a": 1 } })),
    )
    .await;
    assert_eq!(stale.status(), StatusCode::PRECONDITION_FAILED);

    let ok = send(
      &router,
      "PATCH",
      "/profiles/+27820001001",
      vec![(header::IF_MATCH, etag.as_str())],
      Some(json!({ "first_name": "Thandi", "data": { "a": 1 } })),
    )
    .await;
    assert_eq!(ok.status(), StatusCode::OK);
    assert_ne!(ok.headers()[header::ETAG].to_str().unwrap(), etag);
    let patched = json_body(ok).await;
    assert_eq!(patched["first_name"], "Thandi");
    assert_eq!(patched["extension_map"]["a"], 1);
    assert_eq!(patched["extension_map"]["fever"], true);
  }
}
