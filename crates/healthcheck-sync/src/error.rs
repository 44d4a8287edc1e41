//! Error type for `healthcheck-sync`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("unknown sync job: {0:?}")]
  UnknownJob(String),

  #[error("{service} request failed: {message}")]
  Transport { service: &'static str, message: String },

  #[error("{service} returned HTTP {status}: {body}")]
  Status { service: &'static str, status: u16, body: String },

  #[error("{service} response was malformed: {message}")]
  Malformed { service: &'static str, message: String },

  #[error("invalid collaborator configuration: {0}")]
  Config(String),

  #[error("core error: {0}")]
  Core(#[from] healthcheck_core::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  /// Box a backend error from any [`healthcheck_core::store::HealthStore`].
  pub fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }

  /// Whether retrying the same call may succeed: network failures, rate
  /// limiting and server errors.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Transport { .. } => true,
      Self::Status { status, .. } => *status == 429 || (500..=599).contains(status),
      _ => false,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
