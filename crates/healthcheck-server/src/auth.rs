//! HTTP Basic authentication against argon2-hashed user entries.
//!
//! A successful check yields the [`Principal`] the API handlers authorise
//! against; the middleware inserts it as a request extension.

use std::{collections::HashMap, sync::Arc};

use argon2::{
  Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString,
};
use axum::{
  extract::{Request, State},
  http::{HeaderMap, header},
  middleware::Next,
  response::Response,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use healthcheck_core::principal::Principal;
use rand_core::OsRng;
use serde::Deserialize;

use crate::error::Error;

/// One `[[users]]` entry of the configuration.
#[derive(Deserialize, Clone)]
pub struct UserConfig {
  pub username:      String,
  /// PHC string produced by argon2, e.g. `$argon2id$v=19$…`
  pub password_hash: String,
  #[serde(default)]
  pub permissions:   Vec<String>,
}

/// Configured users keyed by username.
#[derive(Clone, Default)]
pub struct UserTable {
  users: HashMap<String, UserConfig>,
}

impl UserTable {
  pub fn new(users: &[UserConfig]) -> Self {
    Self { users: users.iter().map(|u| (u.username.clone(), u.clone())).collect() }
  }

  /// Check the `Authorization: Basic` header and return the caller.
  pub fn verify(&self, headers: &HeaderMap) -> Result<Principal, Error> {
    let header_val = headers
      .get(header::AUTHORIZATION)
      .and_then(|v| v.to_str().ok())
      .ok_or(Error::Unauthorized)?;

    let encoded = header_val.strip_prefix("Basic ").ok_or(Error::Unauthorized)?;
    let decoded = B64.decode(encoded).map_err(|_| Error::Unauthorized)?;
    let creds = std::str::from_utf8(&decoded).map_err(|_| Error::Unauthorized)?;
    let (username, password) = creds.split_once(':').ok_or(Error::Unauthorized)?;

    let user = self.users.get(username).ok_or(Error::Unauthorized)?;
    let parsed_hash = PasswordHash::new(&user.password_hash).map_err(|_| Error::Unauthorized)?;
    Argon2::default()
      .verify_password(password.as_bytes(), &parsed_hash)
      .map_err(|_| Error::Unauthorized)?;

    Ok(Principal::new(user.username.clone(), user.permissions.iter().cloned()))
  }
}

/// Middleware: authenticate the request and attach its [`Principal`].
pub async fn require_principal(
  State(users): State<Arc<UserTable>>,
  mut req: Request,
  next: Next,
) -> Result<Response, Error> {
  let principal = users.verify(req.headers())?;
  tracing::debug!(user = %principal.username, "authenticated");
  req.extensions_mut().insert(principal);
  Ok(next.run(req).await)
}

/// Argon2id PHC string for `password` with a fresh salt.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
  let salt = SaltString::generate(&mut OsRng);
  Ok(Argon2::default().hash_password(password.as_bytes(), &salt)?.to_string())
}
