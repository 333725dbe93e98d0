use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of a read, including where the data came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved<T> {
  /// The data, `None` only when every tier came up empty
  pub data: Option<T>,
  pub source: Source,
  /// When the data was last fetched from the server, if it ever was
  pub last_updated: Option<DateTime<Utc>>,
}

impl<T> Resolved<T> {
  pub fn from_cache(data: T, last_updated: DateTime<Utc>) -> Self {
    Self {
      data: Some(data),
      source: Source::Cache,
      last_updated: Some(last_updated),
    }
  }

  pub fn from_remote(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self {
      data: Some(data),
      source: Source::Remote,
      last_updated: Some(fetched_at),
    }
  }

  pub fn from_fallback(data: T) -> Self {
    Self {
      data: Some(data),
      source: Source::Fallback,
      last_updated: None,
    }
  }

  pub fn stale(data: T, last_updated: DateTime<Utc>) -> Self {
    Self {
      data: Some(data),
      source: Source::Stale,
      last_updated: Some(last_updated),
    }
  }

  pub fn empty() -> Self {
    Self {
      data: None,
      source: Source::Empty,
      last_updated: None,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_none()
  }
}

/// Which tier produced a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
  /// Fresh cache entry
  Cache,
  /// Live fetch from the server
  Remote,
  /// Bundled fallback/demo dataset, never real data
  Fallback,
  /// Expired cache entry served because nothing fresher was reachable
  Stale,
  /// No tier had data
  Empty,
}
