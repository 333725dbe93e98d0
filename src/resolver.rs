//! Read path with ordered fallback tiers.
//!
//! Tiers, first success wins:
//! 1. fresh cache entry
//! 2. live fetch (skipped in degraded mode), written back to the cache
//! 3. fallback dataset, never written to the cache
//! 4. expired cache entry (stale-while-unreachable)
//! 5. explicit empty result

use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheStore, Resolved};
use crate::clock::millis;
use crate::config::CacheConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::fallback::FallbackDataset;
use crate::remote::{RemoteCall, RemoteClient, RemoteResponse};
use crate::store::DurableStore;

/// Parameters for one read.
#[derive(Debug, Clone)]
pub struct ReadRequest {
  pub key: String,
  pub ttl: Duration,
  /// Skip tier 1 even when the cache is fresh
  pub force_refresh: bool,
  /// Budget for the live fetch; the resolver default applies when unset
  pub timeout: Option<std::time::Duration>,
}

impl ReadRequest {
  pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
    Self {
      key: key.into(),
      ttl,
      force_refresh: false,
      timeout: None,
    }
  }

  pub fn force_refresh(mut self) -> Self {
    self.force_refresh = true;
    self
  }

  pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

pub struct FallbackResolver<S: DurableStore, R: RemoteClient> {
  cache: CacheStore<S>,
  monitor: ConnectivityMonitor<R>,
  remote: Arc<R>,
  dataset: Arc<FallbackDataset>,
  list_ttl: Duration,
  fetch_timeout: std::time::Duration,
}

impl<S: DurableStore, R: RemoteClient> FallbackResolver<S, R> {
  pub fn new(
    cache: CacheStore<S>,
    monitor: ConnectivityMonitor<R>,
    remote: Arc<R>,
    dataset: Arc<FallbackDataset>,
    config: &CacheConfig,
  ) -> Self {
    Self {
      cache,
      monitor,
      remote,
      dataset,
      list_ttl: millis(config.list_ttl_ms),
      fetch_timeout: config.fetch_timeout(),
    }
  }

  pub fn cache(&self) -> &CacheStore<S> {
    &self.cache
  }

  pub fn dataset(&self) -> &FallbackDataset {
    &self.dataset
  }

  /// Run a read through the tiers.
  ///
  /// Only misuse (empty key, non-positive TTL) is an error. A fetch that
  /// outlives its budget is dropped, so a late response can never overwrite
  /// the cache.
  pub async fn resolve<T, F, Fut, FB>(
    &self,
    request: ReadRequest,
    fetch: F,
    fallback: FB,
  ) -> Result<Resolved<T>>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResponse<T>>,
    FB: FnOnce() -> Option<T>,
  {
    let key = request.key.as_str();
    crate::cache::validate_key(key)?;
    if request.ttl <= Duration::zero() {
      return Err(SyncError::InvalidTtl {
        key: key.to_string(),
        ttl_ms: request.ttl.num_milliseconds(),
      });
    }

    // 1. Fresh cache
    if !request.force_refresh {
      if let Some(entry) = self.cache.get_valid::<T>(key) {
        debug!(key, "served from cache");
        return Ok(Resolved::from_cache(entry.payload, entry.last_updated));
      }
    }

    // 2. Live fetch
    let verdict = self.monitor.verdict(false).await;
    if verdict.is_degraded_mode {
      debug!(key, "degraded mode, skipping live fetch");
    } else {
      let budget = request.timeout.unwrap_or(self.fetch_timeout);
      match tokio::time::timeout(budget, fetch()).await {
        Ok(response) => match response.into_result() {
          Ok(data) => {
            self.cache.put(key, &data, request.ttl)?;
            debug!(key, "served from remote");
            return Ok(Resolved::from_remote(data, self.cache.now()));
          }
          Err(error) => debug!(key, %error, "live fetch failed, falling through"),
        },
        Err(_) => warn!(key, ?budget, "live fetch cancelled at its time budget"),
      }
    }

    // 3. Fallback dataset
    if let Some(data) = fallback() {
      debug!(key, "served from fallback dataset");
      return Ok(Resolved::from_fallback(data));
    }

    // 4. Whatever the cache still has
    if let Some(entry) = self.cache.get::<T>(key) {
      if entry.is_valid_at(self.cache.now()) {
        return Ok(Resolved::from_cache(entry.payload, entry.last_updated));
      }
      warn!(key, last_updated = %entry.last_updated, "serving stale data");
      return Ok(Resolved::stale(entry.payload, entry.last_updated));
    }

    // 5. Nothing
    debug!(key, "no tier had data");
    Ok(Resolved::empty())
  }

  /// Read a key through the tiers using the remote client and the bundled
  /// fallback dataset.
  pub async fn read<T>(&self, request: ReadRequest, call: RemoteCall) -> Result<Resolved<T>>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
  {
    let dataset = Arc::clone(&self.dataset);
    let key = request.key.clone();
    self
      .resolve(
        request,
        || self.remote.request::<T>(call),
        move || dataset.get::<T>(&key),
      )
      .await
  }

  /// All documents of an entity type, cached for the list TTL.
  pub async fn list(&self, entity_type: &str, force_refresh: bool) -> Result<Resolved<Vec<Value>>> {
    let mut request = ReadRequest::new(CacheKey::list(entity_type).to_string(), self.list_ttl);
    request.force_refresh = force_refresh;
    self.read(request, RemoteCall::list(entity_type)).await
  }

  /// Documents matching `filters`, cached apart from the unfiltered list.
  ///
  /// `filters` is passed through to the server as the `filters` query
  /// parameter. The bundled dataset only answers unfiltered lists, so a
  /// filtered read falls from the server straight to the stale tier.
  pub async fn list_filtered(
    &self,
    entity_type: &str,
    filters: Value,
    force_refresh: bool,
  ) -> Result<Resolved<Vec<Value>>> {
    let call = RemoteCall::list(entity_type).with_params(serde_json::json!({ "filters": filters }));
    let key = CacheKey::filtered_list(entity_type, filters);
    let mut request = ReadRequest::new(key.to_string(), self.list_ttl);
    request.force_refresh = force_refresh;
    self.read(request, call).await
  }

  /// A single document, cached for the list TTL.
  pub async fn document(&self, entity_type: &str, id: &str) -> Result<Resolved<Value>> {
    let request = ReadRequest::new(CacheKey::document(entity_type, id).to_string(), self.list_ttl);
    self.read(request, RemoteCall::document(entity_type, id)).await
  }
}
