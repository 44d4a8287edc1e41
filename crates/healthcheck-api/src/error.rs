//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use healthcheck_core::validate::{FieldError, PhoneNumberError, ValidationErrors};
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("validation failed: {0}")]
  Validation(ValidationErrors),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("permission denied: {0}")]
  Forbidden(String),

  #[error("precondition failed")]
  PreconditionFailed,

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("internal error: {0}")]
  Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ApiError {
  /// A 400 for a phone number given in the URL or query string.
  pub fn msisdn(reason: PhoneNumberError) -> Self {
    Self::Validation(ValidationErrors::single(
      "msisdn",
      FieldError::InvalidPhoneNumber { reason },
    ))
  }
}

impl From<healthcheck_core::Error> for ApiError {
  fn from(e: healthcheck_core::Error) -> Self {
    use healthcheck_core::Error as E;
    match e {
      E::Validation(errors) => Self::Validation(errors),
      E::NotFound(what) => Self::NotFound(what),
      E::UnknownEventKind(kind) => Self::NotFound(format!("event kind {kind:?}")),
      E::Forbidden(permission) => Self::Forbidden(permission),
      E::PreconditionFailed => Self::PreconditionFailed,
      E::Conflict(msg) => Self::Conflict(msg),
      other @ (E::UnknownRegion(_) | E::Serialization(_) | E::Store(_)) => {
        Self::Internal(Box::new(other))
      }
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, body) = match &self {
      ApiError::Validation(errors) => (StatusCode::BAD_REQUEST, json!({ "errors": errors })),
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, json!({ "error": m })),
      ApiError::Forbidden(p) => {
        (StatusCode::FORBIDDEN, json!({ "error": format!("missing permission {p}") }))
      }
      ApiError::PreconditionFailed => {
        (StatusCode::PRECONDITION_FAILED, json!({ "error": "precondition failed" }))
      }
      ApiError::Conflict(m) => (StatusCode::CONFLICT, json!({ "error": m })),
      ApiError::Internal(e) => {
        tracing::error!(error = %e, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "internal error" }))
      }
    };
    (status, Json(body)).into_response()
  }
}
