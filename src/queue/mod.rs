//! Durable queue of local writes, replayed when the server is reachable.
//!
//! Records are replayed per entity type as independent streams. Within a
//! stream they go in creation order, and a record that has not succeeded
//! (backing off or parked as failed) holds back every later record for the
//! same entity id. Only one drain runs at a time.

mod record;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use ulid::Ulid;

pub use record::{MutationAction, MutationRecord, MutationStatus};

use crate::cache::CacheStore;
use crate::clock::{millis, Clock};
use crate::config::QueueConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::remote::RemoteClient;
use crate::store::{DurableStore, Row, Table};

/// Notifications emitted while draining.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
  Replayed {
    id: String,
    entity_type: String,
    entity_id: String,
  },
  RetryScheduled {
    id: String,
    retries: u32,
    next_attempt_at: DateTime<Utc>,
    error: String,
  },
  /// Retry ceiling reached; the record is parked as failed
  NeedsAttention(MutationRecord),
}

/// Why a drain did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainSkip {
  AlreadyRunning,
  Offline,
  StorageUnavailable,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
  pub skipped: Option<DrainSkip>,
  /// Ids confirmed by the server and removed from the queue
  pub replayed: Vec<String>,
  /// Failed attempts that will be retried later
  pub retried: usize,
  /// Records held back by backoff or by an earlier record for the same entity
  pub deferred: usize,
  /// Records that reached the retry ceiling during this drain
  pub needs_attention: Vec<MutationRecord>,
}

impl DrainReport {
  fn skipped(reason: DrainSkip) -> Self {
    Self {
      skipped: Some(reason),
      ..Self::default()
    }
  }

  fn merge(&mut self, other: DrainReport) {
    self.replayed.extend(other.replayed);
    self.retried += other.retried;
    self.deferred += other.deferred;
    self.needs_attention.extend(other.needs_attention);
  }

  /// Exhausted mutations as errors, for callers that propagate them.
  pub fn exhausted(&self) -> Vec<SyncError> {
    self
      .needs_attention
      .iter()
      .map(|r| SyncError::RetriesExhausted {
        id: r.id.clone(),
        attempts: r.retries,
        last_error: r.last_error.clone().unwrap_or_default(),
      })
      .collect()
  }
}

/// Pending and failed counts for one entity type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
  pub pending: usize,
  pub failed: usize,
}

/// Ids handed out so far. Seeded from the stored queue on first use so that
/// ids keep increasing across restarts, even when the clock steps back.
#[derive(Default)]
struct IdSequence {
  seeded: bool,
  last: Option<Ulid>,
}

pub struct MutationQueue<S: DurableStore, R: RemoteClient> {
  store: Arc<S>,
  remote: Arc<R>,
  monitor: ConnectivityMonitor<R>,
  cache: CacheStore<S>,
  clock: Arc<dyn Clock>,
  max_retries: u32,
  base_delay_ms: u64,
  cap_delay_ms: u64,
  ids: Mutex<IdSequence>,
  drain_lock: tokio::sync::Mutex<()>,
  events: broadcast::Sender<QueueEvent>,
}

impl<S: DurableStore, R: RemoteClient> MutationQueue<S, R> {
  pub fn new(
    store: Arc<S>,
    remote: Arc<R>,
    monitor: ConnectivityMonitor<R>,
    cache: CacheStore<S>,
    clock: Arc<dyn Clock>,
    config: &QueueConfig,
  ) -> Self {
    let (events, _) = broadcast::channel(64);
    Self {
      store,
      remote,
      monitor,
      cache,
      clock,
      max_retries: config.max_retries.max(1),
      base_delay_ms: config.base_delay_ms,
      cap_delay_ms: config.cap_delay_ms,
      ids: Mutex::new(IdSequence::default()),
      drain_lock: tokio::sync::Mutex::new(()),
      events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
    self.events.subscribe()
  }

  /// Durably record a local write.
  ///
  /// Applying the change to the local view is the caller's job; the queue
  /// only guarantees the write is kept until the server confirms it.
  pub fn enqueue(
    &self,
    entity_type: &str,
    entity_id: &str,
    action: MutationAction,
    payload: Value,
  ) -> Result<MutationRecord> {
    if entity_type.trim().is_empty() {
      return Err(SyncError::InvalidMutation("entity type is empty".to_string()));
    }
    if entity_id.trim().is_empty() {
      return Err(SyncError::InvalidMutation("entity id is empty".to_string()));
    }

    let now = self.clock.now();
    let record = MutationRecord {
      id: self.next_id(now)?,
      entity_type: entity_type.to_string(),
      entity_id: entity_id.to_string(),
      action,
      payload,
      created_at: now,
      retries: 0,
      last_error: None,
      status: MutationStatus::Pending,
      next_attempt_at: None,
    };

    self.save(&record)?;
    info!(id = %record.id, entity_type, entity_id, %action, "mutation queued");
    Ok(record)
  }

  pub fn get(&self, id: &str) -> Result<Option<MutationRecord>> {
    self
      .store
      .get(Table::SyncQueue, id)
      .map_err(storage_error)?
      .map(|row| decode(&row))
      .transpose()
  }

  /// Every record, oldest first.
  pub fn all(&self) -> Result<Vec<MutationRecord>> {
    let rows = self.store.scan(Table::SyncQueue).map_err(storage_error)?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
      match decode(&row) {
        Ok(record) => records.push(record),
        Err(e) => warn!(key = %row.key, error = %e, "skipping unreadable queue row"),
      }
    }
    records.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(records)
  }

  pub fn pending(&self) -> Result<Vec<MutationRecord>> {
    Ok(
      self
        .all()?
        .into_iter()
        .filter(|r| r.status == MutationStatus::Pending)
        .collect(),
    )
  }

  pub fn failed(&self) -> Result<Vec<MutationRecord>> {
    Ok(self.all()?.into_iter().filter(|r| r.is_failed()).collect())
  }

  pub fn summary(&self) -> Result<BTreeMap<String, QueueSummary>> {
    let mut summary: BTreeMap<String, QueueSummary> = BTreeMap::new();
    for record in self.all()? {
      let entry = summary.entry(record.entity_type).or_default();
      match record.status {
        MutationStatus::Pending => entry.pending += 1,
        MutationStatus::Failed => entry.failed += 1,
      }
    }
    Ok(summary)
  }

  /// Give a record a fresh set of attempts, starting at the next drain.
  pub fn retry(&self, id: &str) -> Result<MutationRecord> {
    let mut record = self
      .get(id)?
      .ok_or_else(|| SyncError::UnknownMutation(id.to_string()))?;

    record.status = MutationStatus::Pending;
    record.retries = 0;
    record.next_attempt_at = None;
    self.save(&record)?;
    info!(id, "mutation re-armed for replay");
    Ok(record)
  }

  /// Drop a record without replaying it.
  pub fn discard(&self, id: &str) -> Result<MutationRecord> {
    let record = self
      .get(id)?
      .ok_or_else(|| SyncError::UnknownMutation(id.to_string()))?;

    self
      .store
      .delete(Table::SyncQueue, id)
      .map_err(storage_error)?;
    warn!(id, entity_type = %record.entity_type, entity_id = %record.entity_id, "mutation discarded");
    Ok(record)
  }

  /// Replay due records against the server.
  ///
  /// Returns immediately if another drain is running or the server is not
  /// usable. Records that reach the retry ceiling are reported in
  /// `needs_attention` and broadcast as `QueueEvent::NeedsAttention`.
  pub async fn drain(&self) -> DrainReport {
    let Ok(_guard) = self.drain_lock.try_lock() else {
      debug!("drain already running");
      return DrainReport::skipped(DrainSkip::AlreadyRunning);
    };

    if self.monitor.is_degraded().await {
      debug!("degraded mode, not draining");
      return DrainReport::skipped(DrainSkip::Offline);
    }

    let records = match self.all() {
      Ok(records) => records,
      Err(e) => {
        warn!(error = %e, "queue unreadable, not draining");
        return DrainReport::skipped(DrainSkip::StorageUnavailable);
      }
    };
    if records.is_empty() {
      return DrainReport::default();
    }

    let mut streams: BTreeMap<String, Vec<MutationRecord>> = BTreeMap::new();
    for record in records {
      streams
        .entry(record.entity_type.clone())
        .or_default()
        .push(record);
    }

    let mut report = DrainReport::default();
    for stream in join_all(streams.into_values().map(|records| self.drain_stream(records))).await {
      report.merge(stream);
    }

    info!(
      replayed = report.replayed.len(),
      retried = report.retried,
      deferred = report.deferred,
      failed = report.needs_attention.len(),
      "drain finished"
    );
    report
  }

  /// Replay one entity type's records strictly in order.
  async fn drain_stream(&self, records: Vec<MutationRecord>) -> DrainReport {
    let mut report = DrainReport::default();
    let mut blocked: HashSet<String> = records
      .iter()
      .filter(|r| r.is_failed())
      .map(|r| r.entity_id.clone())
      .collect();

    for mut record in records.into_iter().filter(|r| !r.is_failed()) {
      if blocked.contains(&record.entity_id) || !record.is_due(self.clock.now()) {
        blocked.insert(record.entity_id.clone());
        report.deferred += 1;
        continue;
      }

      let response = self.remote.request::<Value>(record.remote_call()).await;
      match response.into_result() {
        Ok(_) => {
          if let Err(e) = self.store.delete(Table::SyncQueue, &record.id) {
            warn!(id = %record.id, error = %e, "replayed mutation could not be removed");
          }
          self.cache.invalidate_entity_type(&record.entity_type);
          debug!(id = %record.id, "mutation replayed");
          let _ = self.events.send(QueueEvent::Replayed {
            id: record.id.clone(),
            entity_type: record.entity_type.clone(),
            entity_id: record.entity_id.clone(),
          });
          report.replayed.push(record.id);
        }
        Err(error) => {
          blocked.insert(record.entity_id.clone());
          record.retries += 1;
          record.last_error = Some(error.to_string());

          if record.retries >= self.max_retries {
            record.status = MutationStatus::Failed;
            record.next_attempt_at = None;
            warn!(id = %record.id, retries = record.retries, %error, "mutation needs attention");
            let _ = self.events.send(QueueEvent::NeedsAttention(record.clone()));
            report.needs_attention.push(record.clone());
          } else {
            let next_attempt_at = self.clock.now() + self.backoff(record.retries);
            record.next_attempt_at = Some(next_attempt_at);
            debug!(id = %record.id, retries = record.retries, %next_attempt_at, %error, "replay failed, will retry");
            let _ = self.events.send(QueueEvent::RetryScheduled {
              id: record.id.clone(),
              retries: record.retries,
              next_attempt_at,
              error: error.to_string(),
            });
            report.retried += 1;
          }

          if let Err(e) = self.save(&record) {
            warn!(id = %record.id, error = %e, "could not persist retry state");
          }
        }
      }
    }

    report
  }

  /// `min(2^retries * base, cap)`
  pub fn backoff(&self, retries: u32) -> Duration {
    let factor = 1u64.checked_shl(retries).unwrap_or(u64::MAX);
    millis(
      self
        .base_delay_ms
        .saturating_mul(factor)
        .min(self.cap_delay_ms),
    )
  }

  /// Next ULID, strictly above every id already issued or stored.
  fn next_id(&self, now: DateTime<Utc>) -> Result<String> {
    let mut ids = self.ids.lock().unwrap_or_else(|e| e.into_inner());
    if !ids.seeded {
      ids.last = self
        .store
        .scan(Table::SyncQueue)
        .map_err(storage_error)?
        .iter()
        .filter_map(|row| Ulid::from_string(&row.key).ok())
        .max();
      ids.seeded = true;
    }

    let fresh = Ulid::from_datetime(SystemTime::from(now));
    let id = match ids.last {
      Some(last) if fresh <= last => last
        .increment()
        .ok_or_else(|| SyncError::Storage("mutation id space exhausted".to_string()))?,
      _ => fresh,
    };
    ids.last = Some(id);
    Ok(id.to_string())
  }

  fn save(&self, record: &MutationRecord) -> Result<()> {
    let data = serde_json::to_vec(record).map_err(|e| SyncError::Storage(e.to_string()))?;
    self
      .store
      .put(
        Table::SyncQueue,
        Row::new(record.id.clone(), Some(record.entity_type.clone()), data),
      )
      .map_err(storage_error)
  }
}

fn decode(row: &Row) -> Result<MutationRecord> {
  serde_json::from_slice(&row.data)
    .map_err(|e| SyncError::Storage(format!("corrupt queue row {}: {}", row.key, e)))
}

fn storage_error(e: color_eyre::Report) -> SyncError {
  SyncError::Storage(e.to_string())
}
