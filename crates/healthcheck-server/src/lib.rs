//! HTTP server for health-check ingestion and sync.
//!
//! Wires the JSON API from `healthcheck-api`, the sync dispatcher from
//! `healthcheck-sync` and HTTP Basic authentication into one axum
//! [`Router`].

pub mod auth;
pub mod error;
pub mod scheduler;

pub use error::Error;

use std::{path::PathBuf, sync::Arc};

use axum::{
  Extension, Json, Router,
  extract::{Path, State},
  middleware,
  routing::{get, post},
};
use healthcheck_core::{
  arm::StudyConfig,
  principal::{Principal, permission},
  service::HealthService,
  store::HealthStore,
};
use healthcheck_sync::{Dispatcher, SyncConfig, SyncOutcome};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use auth::{UserConfig, UserTable};

// ─── Configuration ────────────────────────────────────────────────────────────

/// Runtime server configuration, deserialised from `config.toml` and
/// `HEALTHCHECK_*` environment variables.
#[derive(Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
  pub host:           String,
  pub port:           u16,
  pub store_path:     PathBuf,
  /// Region assumed for phone numbers submitted without a country code.
  pub default_region: String,
  pub users:          Vec<UserConfig>,
  /// Randomised study arm assignment for TB checks; absent disables it.
  pub tb_study:       Option<StudyConfig>,
  pub sync:           SyncConfig,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host:           "127.0.0.1".to_string(),
      port:           8000,
      store_path:     PathBuf::from("~/.local/share/healthcheck/healthcheck.db"),
      default_region: "ZA".to_string(),
      users:          Vec::new(),
      tb_study:       None,
      sync:           SyncConfig::default(),
    }
  }
}

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through the server's own handlers.
pub struct AppState<S: HealthStore> {
  pub service:    HealthService<S>,
  pub dispatcher: Dispatcher<S>,
  pub users:      Arc<UserTable>,
}

impl<S: HealthStore> Clone for AppState<S> {
  fn clone(&self) -> Self {
    Self {
      service:    self.service.clone(),
      dispatcher: self.dispatcher.clone(),
      users:      Arc::clone(&self.users),
    }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the full server [`Router`].
///
/// Everything except `/health` requires HTTP Basic credentials.
pub fn router<S>(state: AppState<S>) -> Router
where
  S: HealthStore + 'static,
{
  let users = Arc::clone(&state.users);
  let api = healthcheck_api::api_router(state.service.clone());

  Router::new()
    .route("/sync/{job}", post(run_sync::<S>))
    .with_state(state)
    .nest("/api", api)
    .layer(middleware::from_fn_with_state(users, auth::require_principal))
    .route("/health", get(health))
    .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<Value> { Json(json!({ "status": "ok" })) }

async fn run_sync<S>(
  State(state): State<AppState<S>>,
  Extension(principal): Extension<Principal>,
  Path(job): Path<String>,
) -> Result<Json<SyncOutcome>, Error>
where
  S: HealthStore + 'static,
{
  principal.require(permission::RUN_SYNC)?;
  tracing::info!(job, user = %principal.username, "sync requested");
  let outcome = state.dispatcher.run_sync(&job).await?;
  Ok(Json(outcome))
}

// ─── Integration tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use axum::{
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
  };
  use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
  use healthcheck_core::validate::Validator;
  use healthcheck_store_sqlite::SqliteStore;
  use tower::ServiceExt as _;

  use super::*;

  async fn make_router() -> Router {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let users = [
      UserConfig {
        username:      "ussd".to_string(),
        password_hash: auth::hash_password("secret").unwrap(),
        permissions:   vec!["add_triage".to_string(), "view_profile".to_string()],
      },
      UserConfig {
        username:      "ops".to_string(),
        password_hash: auth::hash_password("ops-secret").unwrap(),
        permissions:   vec!["run_sync".to_string()],
      },
    ];
    let state = AppState {
      service:    HealthService::new(Arc::clone(&store), Validator::new("ZA").unwrap(), None),
      dispatcher: Dispatcher::new(store, &SyncConfig::default()),
      users:      Arc::new(UserTable::new(&users)),
    };
    router(state)
  }

  fn auth_header(user: &str, pass: &str) -> String {
    format!("Basic {}", B64.encode(format!("{user}:{pass}")))
  }

  async fn send(
    router: &Router,
    method: &str,
    uri:    &str,
    auth:   Option<(&str, &str)>,
    body:   Option<Value>,
  ) -> Response {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some((user, pass)) = auth {
      builder = builder.header(header::AUTHORIZATION, auth_header(user, pass));
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

  fn triage() -> Value {
    json!({
      "deduplication_id": "k1",
      "msisdn": "0820001001",
      "source": "USSD",
      "province": "ZA-WC",
      "city": "Cape Town",
      "age": "18-40",
      "fever": false,
      "cough": false,
      "sore_throat": false,
      "exposure": "no",
      "tracing": true,
      "risk": "low",
      "city_location": "-33.92487+018.42406/",
    })
  }

  #[tokio::test]
  async fn health_needs_no_credentials() {
    let router = make_router().await;
    let resp = send(&router, "GET", "/health", None, None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["status"], "ok");
  }

  #[tokio::test]
  async fn unauthenticated_requests_return_401() {
    let router = make_router().await;
    let resp = send(&router, "POST", "/api/events/triage", None, Some(triage())).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().contains_key(header::WWW_AUTHENTICATE));

    let wrong = send(&router, "POST", "/api/events/triage", Some(("ussd", "nope")), Some(triage()))
      .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn authenticated_user_submits_and_reads_profile() {
    let router = make_router().await;
    let creds = Some(("ussd", "secret"));

    let created = send(&router, "POST", "/api/events/triage", creds, Some(triage())).await;
    assert_eq!(created.status(), StatusCode::CREATED);
    assert_eq!(json_body(created).await["created_by"], "ussd");

    let profile = send(&router, "GET", "/api/profiles/+27820001001", creds, None).await;
    assert_eq!(profile.status(), StatusCode::OK);
    assert_eq!(json_body(profile).await["extension_map"]["risk"], "low");
  }

  #[tokio::test]
  async fn sync_route_checks_permission_and_job() {
    let router = make_router().await;

    let forbidden = send(&router, "POST", "/sync/warehouse", Some(("ussd", "secret")), None).await;
    assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

    let ops = Some(("ops", "ops-secret"));
    let outcome = send(&router, "POST", "/sync/warehouse", ops, None).await;
    assert_eq!(outcome.status(), StatusCode::OK);
    assert_eq!(json_body(outcome).await["status"], "not_configured");

    let unknown = send(&router, "POST", "/sync/carrier_pigeon", ops, None).await;
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
  }
}
