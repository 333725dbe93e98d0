use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;

use crate::remote::RemoteCall;

/// What a queued write does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
  Create,
  Update,
  /// Finalize (submit) the document
  Complete,
}

impl MutationAction {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Update => "update",
      Self::Complete => "complete",
    }
  }
}

impl std::fmt::Display for MutationAction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for MutationAction {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "create" => Ok(Self::Create),
      "update" => Ok(Self::Update),
      "complete" | "submit" => Ok(Self::Complete),
      other => Err(format!("unknown action: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
  /// Waiting for (another) replay
  Pending,
  /// Hit the retry ceiling; needs an operator to retry or discard it
  Failed,
}

/// A local write waiting to be replayed against the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
  /// ULID; lexical order is creation order
  pub id: String,
  pub entity_type: String,
  pub entity_id: String,
  pub action: MutationAction,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub retries: u32,
  pub last_error: Option<String>,
  pub status: MutationStatus,
  /// Earliest time the next replay may run; unset means immediately
  pub next_attempt_at: Option<DateTime<Utc>>,
}

impl MutationRecord {
  pub fn is_due(&self, now: DateTime<Utc>) -> bool {
    self.status == MutationStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
  }

  pub fn is_failed(&self) -> bool {
    self.status == MutationStatus::Failed
  }

  /// The document API request that replays this mutation.
  pub fn remote_call(&self) -> RemoteCall {
    match self.action {
      MutationAction::Create => RemoteCall::create(&self.entity_type, self.payload.clone()),
      MutationAction::Update => {
        RemoteCall::update(&self.entity_type, &self.entity_id, self.payload.clone())
      }
      MutationAction::Complete => {
        let mut doc = match &self.payload {
          Value::Object(map) => map.clone(),
          _ => serde_json::Map::new(),
        };
        doc.insert("doctype".to_string(), json!(self.entity_type));
        doc.insert("name".to_string(), json!(self.entity_id));
        RemoteCall::post("/api/method/frappe.client.submit", json!({ "doc": doc }))
      }
    }
  }
}
