//! The authenticated caller, as handed over by the auth gate.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{Error, Result, event::EventKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
  pub username:    String,
  pub permissions: BTreeSet<String>,
}

impl Principal {
  pub fn new<I, P>(username: impl Into<String>, permissions: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<String>,
  {
    Self {
      username:    username.into(),
      permissions: permissions.into_iter().map(Into::into).collect(),
    }
  }

  pub fn has(&self, permission: &str) -> bool { self.permissions.contains(permission) }

  /// Fail with [`Error::Forbidden`] unless the principal holds `permission`.
  pub fn require(&self, permission: &str) -> Result<()> {
    if self.has(permission) {
      Ok(())
    } else {
      Err(Error::Forbidden(permission.to_owned()))
    }
  }
}

/// Permission names.
pub mod permission {
  use super::EventKind;

  pub const VIEW_PROFILE: &str = "view_profile";
  pub const CHANGE_PROFILE: &str = "change_profile";
  pub const RUN_SYNC: &str = "run_sync";

  pub fn add(kind: EventKind) -> String { format!("add_{kind}") }

  pub fn view(kind: EventKind) -> String { format!("view_{kind}") }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn require_checks_membership() {
    let p = Principal::new("ussd", [permission::add(EventKind::Triage)]);
    assert!(p.require("add_triage").is_ok());
    assert!(matches!(p.require(permission::VIEW_PROFILE), Err(Error::Forbidden(_))));
  }
}
