//! ETag computation for profiles.
//!
//! The ETag is a SHA-256 hash over the serialised profile, so any change to a
//! field, an extension key or the version yields a new tag.

use healthcheck_core::profile::Profile;
use sha2::{Digest, Sha256};

/// Compute a quoted ETag for `profile`.
pub fn compute_etag(profile: &Profile) -> String {
  let mut hasher = Sha256::new();
  // Serialising a `Profile` cannot fail: every key is a string.
  if let Ok(bytes) = serde_json::to_vec(profile) {
    hasher.update(&bytes);
  }
  hasher.update(profile.version.to_le_bytes());
  format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Whether an `If-Match` header value admits the current ETag.
///
/// Accepts `*`, comma-separated lists, weak tags and tags without the
/// surrounding quotes.
pub fn if_match_admits(header: &str, current: &str) -> bool {
  let current = strip_etag_quotes(current);
  header.split(',').map(str::trim).any(|candidate| {
    candidate == "*" || strip_etag_quotes(candidate.trim_start_matches("W/")) == current
  })
}

fn strip_etag_quotes(s: &str) -> &str { s.trim_matches('"') }

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  #[test]
  fn extension_change_changes_etag() {
    let a = Profile::new("+27820001001");
    let mut b = a.clone();
    b.extension_map.insert("fever".into(), json!(false));
    assert_ne!(compute_etag(&a), compute_etag(&b));
    assert_eq!(compute_etag(&a), compute_etag(&a.clone()));
  }

  #[test]
  fn if_match_forms() {
    let tag = compute_etag(&Profile::new("+27820001001"));
    let bare = tag.trim_matches('"').to_owned();
    assert!(if_match_admits(&tag, &tag));
    assert!(if_match_admits(&bare, &tag));
    assert!(if_match_admits(&format!("W/{tag}"), &tag));
    assert!(if_match_admits(&format!("\"other\", {tag}"), &tag));
    assert!(if_match_admits("*", &tag));
    assert!(!if_match_admits("\"stale\"", &tag));
  }
}
