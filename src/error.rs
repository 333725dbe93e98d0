//! Errors that cross the library boundary.
//!
//! Transient network failures and cache storage failures are absorbed inside
//! the component that sees them and never show up here.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
  /// Cache key was empty or malformed
  #[error("invalid cache key: {0:?}")]
  InvalidKey(String),

  /// TTL must be strictly positive so that expires_at > last_updated
  #[error("invalid ttl for {key}: {ttl_ms}ms")]
  InvalidTtl { key: String, ttl_ms: i64 },

  /// Mutation arguments were missing or malformed
  #[error("invalid mutation: {0}")]
  InvalidMutation(String),

  /// No queued mutation has this id
  #[error("unknown mutation: {0}")]
  UnknownMutation(String),

  /// Replay hit the retry ceiling; the record is parked as failed
  #[error("mutation {id} failed after {attempts} attempts: {last_error}")]
  RetriesExhausted {
    id: String,
    attempts: u32,
    last_error: String,
  },

  /// A write intent could not be made durable
  #[error("storage error: {0}")]
  Storage(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
