//! Cache store: TTL bookkeeping over `cache_metadata`.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use super::entry::EntryStamp;
use super::{entity_type_of, CacheEntry, MAX_KEY_LENGTH};
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::store::{DurableStore, Row, Table};

/// TTL cache backed by a durable store.
///
/// Storage failures (full quota, corrupted rows) are logged and treated as a
/// miss. A broken cache therefore degrades to "always fetch" rather than
/// failing reads. Only misuse (empty key, non-positive TTL) is reported.
pub struct CacheStore<S: DurableStore> {
  store: Arc<S>,
  clock: Arc<dyn Clock>,
}

impl<S: DurableStore> CacheStore<S> {
  pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
    Self { store, clock }
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }

  /// Look up an entry without judging freshness.
  pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    let row = self.read_row(key)?;
    match serde_json::from_slice(&row.data) {
      Ok(entry) => Some(entry),
      Err(e) => {
        warn!(key, error = %e, "unreadable cache entry, treating as miss");
        None
      }
    }
  }

  /// Look up an entry only if it is still fresh.
  pub fn get_valid<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
    self
      .get(key)
      .filter(|entry: &CacheEntry<T>| entry.is_valid_at(self.now()))
  }

  /// True iff an entry exists and `now < expires_at`.
  pub fn is_valid(&self, key: &str) -> bool {
    self
      .stamp(key)
      .map(|stamp| self.now() < stamp.expires_at)
      .unwrap_or(false)
  }

  /// When the entry was last written, fresh or not.
  pub fn last_updated(&self, key: &str) -> Option<DateTime<Utc>> {
    self.stamp(key).map(|stamp| stamp.last_updated)
  }

  /// Overwrite the entry for `key` with a fresh TTL window.
  ///
  /// The row is replaced in a single write, so concurrent refreshes of the
  /// same key resolve last-write-wins and never leave a half-written entry.
  pub fn put<T: Serialize>(&self, key: &str, payload: &T, ttl: Duration) -> Result<()> {
    validate_key(key)?;
    if ttl <= Duration::zero() {
      return Err(SyncError::InvalidTtl {
        key: key.to_string(),
        ttl_ms: ttl.num_milliseconds(),
      });
    }

    let entry = CacheEntry::new(key, payload, self.now(), ttl);
    let data = match serde_json::to_vec(&entry) {
      Ok(data) => data,
      Err(e) => {
        warn!(key, error = %e, "cache payload not serializable, skipping write");
        return Ok(());
      }
    };

    let row = Row::new(key, entity_type_of(key).map(String::from), data);
    match self.store.put(Table::CacheMetadata, row) {
      Ok(()) => debug!(key, expires_at = %entry.expires_at, "cache entry written"),
      Err(e) => warn!(key, error = %e, "cache write failed, continuing uncached"),
    }
    Ok(())
  }

  /// Drop one entry.
  pub fn invalidate(&self, key: &str) {
    match self.store.delete(Table::CacheMetadata, key) {
      Ok(true) => debug!(key, "cache entry invalidated"),
      Ok(false) => {}
      Err(e) => warn!(key, error = %e, "cache invalidation failed"),
    }
  }

  /// Drop every entry cached for an entity type. Returns how many went.
  pub fn invalidate_entity_type(&self, entity_type: &str) -> usize {
    let rows = match self.store.query_index(Table::CacheMetadata, entity_type) {
      Ok(rows) => rows,
      Err(e) => {
        warn!(entity_type, error = %e, "cache lookup for invalidation failed");
        return 0;
      }
    };

    let mut removed = 0;
    for row in rows {
      match self.store.delete(Table::CacheMetadata, &row.key) {
        Ok(true) => removed += 1,
        Ok(false) => {}
        Err(e) => warn!(key = %row.key, error = %e, "cache invalidation failed"),
      }
    }
    debug!(entity_type, removed, "cache entries invalidated");
    removed
  }

  /// Drop the whole cache. Returns how many entries went.
  pub fn invalidate_all(&self) -> usize {
    match self.store.clear(Table::CacheMetadata) {
      Ok(removed) => {
        debug!(removed, "cache cleared");
        removed
      }
      Err(e) => {
        warn!(error = %e, "cache clear failed");
        0
      }
    }
  }

  fn stamp(&self, key: &str) -> Option<EntryStamp> {
    let row = self.read_row(key)?;
    serde_json::from_slice(&row.data).ok()
  }

  fn read_row(&self, key: &str) -> Option<Row> {
    match self.store.get(Table::CacheMetadata, key) {
      Ok(row) => row,
      Err(e) => {
        warn!(key, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }
}

impl<S: DurableStore> Clone for CacheStore<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      clock: Arc::clone(&self.clock),
    }
  }
}

pub(crate) fn validate_key(key: &str) -> Result<()> {
  if key.trim().is_empty() || key.len() > MAX_KEY_LENGTH {
    return Err(SyncError::InvalidKey(key.to_string()));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheKey;
  use crate::clock::ManualClock;
  use crate::store::MemoryStore;
  use proptest::prelude::*;

  fn setup() -> (CacheStore<MemoryStore>, Arc<MemoryStore>, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at_epoch());
    let cache = CacheStore::new(store.clone(), clock.clone());
    (cache, store, clock)
  }

  #[test]
  fn test_put_then_valid_until_expiry() {
    let (cache, _, clock) = setup();
    cache
      .put("docTypes", &vec!["Item", "Bin"], Duration::milliseconds(300_000))
      .unwrap();

    clock.advance(Duration::milliseconds(299_999));
    assert!(cache.is_valid("docTypes"));

    clock.advance(Duration::milliseconds(2));
    assert!(!cache.is_valid("docTypes"));

    // get still returns the expired entry
    let entry: CacheEntry<Vec<String>> = cache.get("docTypes").unwrap();
    assert_eq!(entry.payload, vec!["Item", "Bin"]);
    assert!(cache.get_valid::<Vec<String>>("docTypes").is_none());
  }

  #[test]
  fn test_missing_key_is_invalid() {
    let (cache, _, _) = setup();
    assert!(!cache.is_valid("nope"));
    assert!(cache.get::<i32>("nope").is_none());
  }

  #[test]
  fn test_put_overwrites_and_resets_ttl() {
    let (cache, _, clock) = setup();
    cache.put("k", &1, Duration::seconds(10)).unwrap();
    clock.advance(Duration::seconds(9));
    cache.put("k", &2, Duration::seconds(10)).unwrap();
    clock.advance(Duration::seconds(9));

    let entry: CacheEntry<i32> = cache.get_valid("k").unwrap();
    assert_eq!(entry.payload, 2);
    assert_eq!(entry.last_updated.timestamp_millis(), 9_000);
  }

  #[test]
  fn test_invalid_arguments_are_rejected() {
    let (cache, _, _) = setup();
    assert!(matches!(
      cache.put("", &1, Duration::seconds(1)),
      Err(SyncError::InvalidKey(_))
    ));
    assert!(matches!(
      cache.put("k", &1, Duration::zero()),
      Err(SyncError::InvalidTtl { .. })
    ));
  }

  #[test]
  fn test_storage_failure_degrades_to_miss() {
    let (cache, store, _) = setup();
    cache.put("k", &1, Duration::seconds(10)).unwrap();

    store.set_failing(true);
    assert!(!cache.is_valid("k"));
    assert!(cache.get::<i32>("k").is_none());
    // writes are swallowed too
    assert!(cache.put("k", &2, Duration::seconds(10)).is_ok());
    assert_eq!(cache.invalidate_all(), 0);

    store.set_failing(false);
    let entry: CacheEntry<i32> = cache.get("k").unwrap();
    assert_eq!(entry.payload, 1);
  }

  #[test]
  fn test_corrupt_row_is_a_miss() {
    let (cache, store, _) = setup();
    store
      .put(Table::CacheMetadata, Row::new("k", None, b"not json".to_vec()))
      .unwrap();

    assert!(!cache.is_valid("k"));
    assert!(cache.get::<i32>("k").is_none());
  }

  #[test]
  fn test_invalidate_entity_type() {
    let (cache, _, _) = setup();
    let ttl = Duration::minutes(5);
    cache.put(&CacheKey::list("Item").to_string(), &vec![1], ttl).unwrap();
    cache.put(&CacheKey::count("Item").to_string(), &1, ttl).unwrap();
    cache.put(&CacheKey::count("Bin").to_string(), &4, ttl).unwrap();

    assert_eq!(cache.invalidate_entity_type("Item"), 2);
    assert!(!cache.is_valid("list:Item"));
    assert!(cache.is_valid("count:Bin"));

    cache.invalidate("count:Bin");
    assert!(!cache.is_valid("count:Bin"));
  }

  #[test]
  fn test_invalidate_all_clears_only_the_cache() {
    let (cache, store, _) = setup();
    let ttl = Duration::minutes(5);
    cache.put("list:Item", &vec![1, 2], ttl).unwrap();
    cache.put("doc:Item:ITM-1", &"wrap", ttl).unwrap();
    cache.put("count:Bin", &4, ttl).unwrap();
    store
      .put(Table::SyncQueue, Row::new("01J0000000000000000000000A", Some("Bin".to_string()), b"{}".to_vec()))
      .unwrap();

    assert_eq!(cache.invalidate_all(), 3);

    assert!(!cache.is_valid("list:Item"));
    assert!(cache.get::<String>("doc:Item:ITM-1").is_none());
    assert!(cache.last_updated("count:Bin").is_none());
    assert_eq!(store.scan(Table::SyncQueue).unwrap().len(), 1);
    assert_eq!(cache.invalidate_all(), 0);
  }

  proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    // Validity flips from true to false exactly once, at expires_at, and
    // never comes back without a new put.
    #[test]
    fn prop_validity_is_monotonic(
      ttl_ms in 1i64..1_000_000,
      probes in prop::collection::vec(0i64..2_000_000, 1..40),
    ) {
      let (cache, _, clock) = setup();
      let mut probes = probes;
      cache.put("k", &"v", Duration::milliseconds(ttl_ms)).unwrap();
      probes.sort_unstable();

      let mut seen_invalid = false;
      for t in probes {
        clock.set(DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(t));
        let valid = cache.is_valid("k");
        prop_assert_eq!(valid, t < ttl_ms);
        if seen_invalid {
          prop_assert!(!valid);
        }
        seen_invalid |= !valid;
      }
    }
  }
}
