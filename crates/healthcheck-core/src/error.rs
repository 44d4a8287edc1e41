//! Error types for `healthcheck-core`.

use thiserror::Error;

use crate::validate::ValidationErrors;

#[derive(Debug, Error)]
pub enum Error {
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

  #[error("unknown event kind: {0:?}")]
  UnknownEventKind(String),

  #[error("unknown phone-number region: {0:?}")]
  UnknownRegion(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<ValidationErrors> for Error {
  fn from(errors: ValidationErrors) -> Self { Self::Validation(errors) }
}

impl Error {
  /// Box a backend error from any [`crate::store::HealthStore`].
  pub fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
