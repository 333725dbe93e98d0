use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A cached payload with its freshness window.
///
/// Invariant: `expires_at > last_updated`. An entry is valid while
/// `now < expires_at`; once that stops holding it stays stale until a new
/// `put` replaces the whole entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
  pub key: String,
  pub payload: T,
  pub last_updated: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  /// Stamp a payload written at `now` with the given TTL.
  pub fn new(key: impl Into<String>, payload: T, now: DateTime<Utc>, ttl: Duration) -> Self {
    Self {
      key: key.into(),
      payload,
      last_updated: now,
      expires_at: now + ttl,
    }
  }

  pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
    now < self.expires_at
  }
}

/// Freshness fields alone, so validity checks skip decoding the payload.
#[derive(Debug, Deserialize)]
pub(crate) struct EntryStamp {
  pub last_updated: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}
