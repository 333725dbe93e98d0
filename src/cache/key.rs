//! Namespaced cache keys.
//!
//! Keys look like `<namespace>:<entityType>[:<qualifier>]`. The entity type
//! segment is stored in the secondary index so one entity type's reads can be
//! invalidated together.

use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Clone, Debug, PartialEq)]
pub enum CacheKey {
  /// All documents of a type, optionally filtered
  List {
    entity_type: String,
    filters: Option<Value>,
  },
  /// A single document
  Document { entity_type: String, id: String },
  /// Document count for a type
  Count { entity_type: String },
}

impl CacheKey {
  pub fn list(entity_type: impl Into<String>) -> Self {
    Self::List {
      entity_type: entity_type.into(),
      filters: None,
    }
  }

  pub fn filtered_list(entity_type: impl Into<String>, filters: Value) -> Self {
    Self::List {
      entity_type: entity_type.into(),
      filters: Some(filters),
    }
  }

  pub fn document(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
    Self::Document {
      entity_type: entity_type.into(),
      id: id.into(),
    }
  }

  pub fn count(entity_type: impl Into<String>) -> Self {
    Self::Count {
      entity_type: entity_type.into(),
    }
  }

  pub fn entity_type(&self) -> &str {
    match self {
      Self::List { entity_type, .. }
      | Self::Document { entity_type, .. }
      | Self::Count { entity_type } => entity_type,
    }
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::List {
        entity_type,
        filters: None,
      } => write!(f, "list:{}", entity_type),
      Self::List {
        entity_type,
        filters: Some(filters),
      } => write!(f, "list:{}:{}", entity_type, filter_hash(filters)),
      Self::Document { entity_type, id } => write!(f, "doc:{}:{}", entity_type, id),
      Self::Count { entity_type } => write!(f, "count:{}", entity_type),
    }
  }
}

/// SHA256 of the filter JSON, for stable fixed-length keys.
///
/// serde_json objects serialize with sorted keys, so logically equal filters
/// hash the same regardless of construction order.
fn filter_hash(filters: &Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(filters.to_string().as_bytes());
  hex::encode(&hasher.finalize()[..16])
}

/// Entity type segment of a namespaced key, if the key has one.
pub fn entity_type_of(key: &str) -> Option<&str> {
  let mut parts = key.splitn(3, ':');
  let namespace = parts.next()?;
  let entity_type = parts.next()?;
  if namespace.is_empty() || entity_type.is_empty() {
    None
  } else {
    Some(entity_type)
  }
}
