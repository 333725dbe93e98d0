//! Per-entity-type document counts.
//!
//! Counts are read far more often than the lists they summarize (every home
//! screen render), so they get their own cache keys and their own, shorter
//! TTL. Reads go through the same tiers as every other read.

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheKey, Source};
use crate::clock::millis;
use crate::config::CacheConfig;
use crate::error::{Result, SyncError};
use crate::remote::{RemoteCall, RemoteClient};
use crate::resolver::{FallbackResolver, ReadRequest};
use crate::store::DurableStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountRecord {
  pub entity_type: String,
  pub count: u64,
  /// Last server confirmation; `None` for fallback counts
  pub last_updated: Option<DateTime<Utc>>,
  pub source: Source,
}

pub struct CountAggregator<S: DurableStore, R: RemoteClient> {
  resolver: Arc<FallbackResolver<S, R>>,
  remote: Arc<R>,
  ttl: Duration,
}

impl<S: DurableStore, R: RemoteClient> CountAggregator<S, R> {
  pub fn new(resolver: Arc<FallbackResolver<S, R>>, remote: Arc<R>, config: &CacheConfig) -> Self {
    Self {
      resolver,
      remote,
      ttl: millis(config.count_ttl_ms),
    }
  }

  /// Count for one entity type; `None` when no tier knows it.
  pub async fn get_count(&self, entity_type: &str) -> Result<Option<CountRecord>> {
    if entity_type.trim().is_empty() {
      return Err(SyncError::InvalidKey(format!("count:{}", entity_type)));
    }

    let request = ReadRequest::new(CacheKey::count(entity_type).to_string(), self.ttl);
    let resolved = self
      .resolver
      .resolve(
        request,
        || self.remote.request::<u64>(RemoteCall::count(entity_type)),
        || self.resolver.dataset().count(entity_type),
      )
      .await?;

    let source = resolved.source;
    let last_updated = resolved.last_updated;
    Ok(resolved.data.map(|count| CountRecord {
      entity_type: entity_type.to_string(),
      count,
      last_updated,
      source,
    }))
  }

  /// Counts for many entity types, fetched concurrently.
  ///
  /// A type that fails or has no count is left out; it never blanks the
  /// counts already resolved for the others.
  pub async fn get_all_counts(&self, entity_types: &[&str]) -> BTreeMap<String, CountRecord> {
    let mut unique: Vec<&str> = entity_types.to_vec();
    unique.sort_unstable();
    unique.dedup();

    let results = join_all(unique.iter().map(|entity_type| self.get_count(entity_type))).await;

    let mut counts = BTreeMap::new();
    for (entity_type, result) in unique.into_iter().zip(results) {
      match result {
        Ok(Some(record)) => {
          counts.insert(entity_type.to_string(), record);
        }
        Ok(None) => debug!(entity_type, "no count available"),
        Err(e) => warn!(entity_type, error = %e, "count lookup failed"),
      }
    }
    counts
  }

  /// Drop the cached count so the next read refetches it.
  pub fn invalidate(&self, entity_type: &str) {
    self
      .resolver
      .cache()
      .invalidate(&CacheKey::count(entity_type).to_string());
  }
}
