//! Bundled fallback (demo) dataset.
//!
//! The file is a JSON object. Keys are either full cache keys
//! (`"count:Item"`, `"doc:Item:ITM-001"`) or bare entity types whose value is
//! the document list, e.g. `{"Item": [{"name": "ITM-001", ...}]}`. Documents
//! and counts are derived from those lists when not listed explicitly.

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::warn;

/// Field holding a document's primary key.
const NAME_FIELD: &str = "name";

#[derive(Debug, Clone, Default)]
pub struct FallbackDataset {
  entries: Map<String, Value>,
}

impl FallbackDataset {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read fallback dataset {}: {}", path.display(), e))?;
    Self::from_json(&contents)
      .map_err(|e| eyre!("Failed to parse fallback dataset {}: {}", path.display(), e))
  }

  pub fn from_json(contents: &str) -> Result<Self> {
    Self::from_value(serde_json::from_str(contents)?)
  }

  pub fn from_value(value: Value) -> Result<Self> {
    match value {
      Value::Object(entries) => Ok(Self { entries }),
      other => Err(eyre!("fallback dataset must be a JSON object, got {}", kind(&other))),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Decode the value for a cache key, if the dataset covers it.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let value = self.lookup(key)?;
    match serde_json::from_value(value) {
      Ok(data) => Some(data),
      Err(e) => {
        warn!(key, error = %e, "fallback data has the wrong shape");
        None
      }
    }
  }

  pub fn list(&self, entity_type: &str) -> Option<&Vec<Value>> {
    self.entries.get(entity_type).and_then(Value::as_array)
  }

  pub fn count(&self, entity_type: &str) -> Option<u64> {
    self
      .entries
      .get(&format!("count:{}", entity_type))
      .and_then(Value::as_u64)
      .or_else(|| self.list(entity_type).map(|docs| docs.len() as u64))
  }

  fn lookup(&self, key: &str) -> Option<Value> {
    if let Some(value) = self.entries.get(key) {
      return Some(value.clone());
    }

    let mut parts = key.splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
      (Some("list"), Some(entity_type), None) => self.list(entity_type).cloned().map(Value::Array),
      (Some("count"), Some(entity_type), None) => self.count(entity_type).map(Value::from),
      (Some("doc"), Some(entity_type), Some(id)) => self
        .list(entity_type)?
        .iter()
        .find(|doc| doc.get(NAME_FIELD).and_then(Value::as_str) == Some(id))
        .cloned(),
      _ => None,
    }
  }
}

fn kind(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "an array",
    Value::Object(_) => "an object",
  }
}
