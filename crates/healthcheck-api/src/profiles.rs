//! Handlers for `/profiles/{msisdn}`.
//!
//! Both responses carry an `ETag`; `PATCH` honours `If-Match`.

use axum::{
  Extension, Json,
  extract::{Path, State},
  http::{HeaderMap, HeaderValue, header},
  response::{IntoResponse, Response},
};
use healthcheck_core::{
  principal::Principal,
  profile::{Profile, ProfilePatch},
  service::HealthService,
  store::HealthStore,
};
use tracing::info;

use crate::{
  error::ApiError,
  etag::{compute_etag, if_match_admits},
};

fn with_etag(profile: Profile) -> Response {
  let etag = compute_etag(&profile);
  let mut res = Json(profile).into_response();
  if let Ok(value) = HeaderValue::from_str(&etag) {
    res.headers_mut().insert(header::ETAG, value);
  }
  res
}

/// `GET /profiles/{msisdn}`: the stored profile, or one rebuilt from the
/// contact's events.
pub async fn get_one<S>(
  State(service): State<HealthService<S>>,
  Extension(principal): Extension<Principal>,
  Path(msisdn): Path<String>,
) -> Result<Response, ApiError>
where
  S: HealthStore + 'static,
{
  let contact_key = service
    .validator()
    .normalize_msisdn(&msisdn)
    .map_err(ApiError::msisdn)?;
  let profile = service.get_profile(&contact_key, &principal).await?;
  Ok(with_etag(profile))
}

/// `PATCH /profiles/{msisdn}`, body: [`ProfilePatch`].
pub async fn patch_one<S>(
  State(service): State<HealthService<S>>,
  Extension(principal): Extension<Principal>,
  Path(msisdn): Path<String>,
  headers: HeaderMap,
  Json(patch): Json<ProfilePatch>,
) -> Result<Response, ApiError>
where
  S: HealthStore + 'static,
{
  let contact_key = service
    .validator()
    .normalize_msisdn(&msisdn)
    .map_err(ApiError::msisdn)?;
  let if_match = headers
    .get(header::IF_MATCH)
    .and_then(|v| v.to_str().ok())
    .map(str::to_owned);

  let profile = service
    .patch_profile(&contact_key, patch, &principal, move |current| match &if_match {
      Some(expected) => if_match_admits(expected, &compute_etag(current)),
      None => true,
    })
    .await?;

  info!(version = profile.version, user = %principal.username, "profile patched");
  Ok(with_etag(profile))
}
