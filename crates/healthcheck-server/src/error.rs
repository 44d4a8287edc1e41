//! Error types and axum `IntoResponse` implementation for the server routes.

use axum::{
  Json,
  http::{HeaderValue, StatusCode, header},
  response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("unauthorized")]
  Unauthorized,
  #[error("permission denied: {0}")]
  Forbidden(String),
  #[error("unknown sync job: {0}")]
  UnknownJob(String),
  #[error("sync error: {0}")]
  Sync(healthcheck_sync::Error),
  #[error("internal error: {0}")]
  Internal(healthcheck_core::Error),
}

impl From<healthcheck_core::Error> for Error {
  fn from(e: healthcheck_core::Error) -> Self {
    match e {
      healthcheck_core::Error::Forbidden(permission) => Self::Forbidden(permission),
      other => Self::Internal(other),
    }
  }
}

impl From<healthcheck_sync::Error> for Error {
  fn from(e: healthcheck_sync::Error) -> Self {
    match e {
      healthcheck_sync::Error::UnknownJob(job) => Self::UnknownJob(job),
      other => Self::Sync(other),
    }
  }
}

impl IntoResponse for Error {
  fn into_response(self) -> Response {
    match self {
      Error::Unauthorized => {
        let mut res = (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
        res.headers_mut().insert(
          header::WWW_AUTHENTICATE,
          HeaderValue::from_static("Basic realm=\"healthcheck\""),
        );
        res
      }
      Error::Forbidden(permission) => (
        StatusCode::FORBIDDEN,
        Json(json!({ "error": format!("missing permission {permission}") })),
      )
        .into_response(),
      Error::UnknownJob(job) => (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("unknown sync job {job}") })),
      )
        .into_response(),
      Error::Sync(e) => {
        tracing::error!(error = %e, "sync run failed");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" })))
          .into_response()
      }
      Error::Internal(e) => {
        tracing::error!(error = %e, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "internal error" })))
          .into_response()
      }
    }
  }
}
