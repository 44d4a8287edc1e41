//! External systems the dispatcher pushes to.
//!
//! Implementations only make the call; retries and sync bookkeeping belong to
//! the [`crate::Dispatcher`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

// ─── Flow engine ─────────────────────────────────────────────────────────────

/// A contact as known to the flow engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowContact {
  pub uuid: String,
  #[serde(default)]
  pub urns: Vec<String>,
}

/// Conversational flow engine that runs follow-up flows.
#[async_trait]
pub trait FlowEngine: Send + Sync {
  /// Contacts holding `urn` (at most one in practice).
  async fn list_contacts(&self, urn: &str) -> Result<Vec<FlowContact>>;

  async fn create_contact(
    &self,
    urn: &str,
    name: Option<&str>,
    fields: &Map<String, Value>,
  ) -> Result<FlowContact>;

  /// Start `flow_id` for every URN, passing `extra` into the flow context.
  async fn create_flow_start(&self, urns: &[String], flow_id: &str, extra: &Value) -> Result<()>;
}

// ─── Warehouse ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
  String,
  Boolean,
  Timestamp,
  Json,
}

/// One column of a warehouse table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Column {
  pub name: &'static str,
  #[serde(rename = "type")]
  pub kind: ColumnType,
}

/// Analytics warehouse receiving batched rows, one table per event kind.
#[async_trait]
pub trait Warehouse: Send + Sync {
  async fn load_rows(
    &self,
    dataset: &str,
    table: &str,
    schema: &[Column],
    rows: &[Value],
  ) -> Result<()>;

  /// Largest value of a timestamp column, or `None` for an empty or missing
  /// table.
  async fn query_max(
    &self,
    dataset: &str,
    table: &str,
    field: &str,
  ) -> Result<Option<DateTime<Utc>>>;
}

// ─── Messaging platform ──────────────────────────────────────────────────────

/// Messaging platform holding a per-contact profile.
#[async_trait]
pub trait MessagingPlatform: Send + Sync {
  async fn patch_contact_profile(&self, contact_id: &str, fields: &Value) -> Result<()>;
}
