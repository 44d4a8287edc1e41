//! Handlers for `/events` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/events/{kind}` | 201 + event when created, 200 + stored event for a repeated `deduplication_id` |
//! | `GET`  | `/events/{kind}/latest` | `?msisdn` required; most recent event of that kind |

use axum::{
  Extension, Json,
  extract::{Path, Query, State},
  http::StatusCode,
  response::IntoResponse,
};
use healthcheck_core::{
  event::{Event, EventKind},
  principal::Principal,
  service::HealthService,
  store::HealthStore,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ApiError;

fn parse_kind(raw: &str) -> Result<EventKind, ApiError> {
  raw
    .parse()
    .map_err(|_| healthcheck_core::Error::UnknownEventKind(raw.to_owned()).into())
}

// ─── Submit ──────────────────────────────────────────────────────────────────

/// `POST /events/{kind}`
pub async fn submit<S>(
  State(service): State<HealthService<S>>,
  Extension(principal): Extension<Principal>,
  Path(kind): Path<String>,
  Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError>
where
  S: HealthStore + 'static,
{
  let kind = parse_kind(&kind)?;
  let submitted = service.submit_event(kind, &body, &principal).await?;

  let status = if submitted.created {
    info!(
      %kind,
      event_id = %submitted.event.event_id,
      source = %submitted.event.source,
      user = %principal.username,
      "event stored"
    );
    StatusCode::CREATED
  } else {
    debug!(
      %kind,
      deduplication_key = %submitted.event.deduplication_key,
      "duplicate submission"
    );
    StatusCode::OK
  };
  Ok((status, Json(submitted.event)))
}

// ─── Latest ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LatestParams {
  pub msisdn: String,
}

/// `GET /events/{kind}/latest?msisdn=<number>`
pub async fn latest<S>(
  State(service): State<HealthService<S>>,
  Extension(principal): Extension<Principal>,
  Path(kind): Path<String>,
  Query(params): Query<LatestParams>,
) -> Result<Json<Event>, ApiError>
where
  S: HealthStore + 'static,
{
  let kind = parse_kind(&kind)?;
  let contact_key = service
    .validator()
    .normalize_msisdn(&params.msisdn)
    .map_err(ApiError::msisdn)?;
  let event = service.latest_event(kind, &contact_key, &principal).await?;
  Ok(Json(event))
}
