//! Durable key-value storage underneath the cache and the mutation queue.
//!
//! Two tables live side by side and never reference each other: cached reads
//! in `cache_metadata` and pending writes in `sync_queue`. Each row carries an
//! optional entity type, which is the single secondary index.

mod memory;
mod sqlite;

use color_eyre::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Tables owned by the sync core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
  /// Cached reads, owned by `CacheStore`
  CacheMetadata,
  /// Pending writes, owned by `MutationQueue`
  SyncQueue,
}

impl Table {
  pub fn name(self) -> &'static str {
    match self {
      Table::CacheMetadata => "cache_metadata",
      Table::SyncQueue => "sync_queue",
    }
  }
}

/// A stored row: primary key, indexed entity type and serialized JSON body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
  pub key: String,
  pub entity_type: Option<String>,
  pub data: Vec<u8>,
}

impl Row {
  pub fn new(key: impl Into<String>, entity_type: Option<String>, data: Vec<u8>) -> Self {
    Self {
      key: key.into(),
      entity_type,
      data,
    }
  }
}

/// Trait for durable storage backends.
///
/// A completed `put` must survive a process restart. Single-row writes are
/// atomic; `bulk_put` commits all rows or none.
pub trait DurableStore: Send + Sync {
  /// Fetch a row by primary key.
  fn get(&self, table: Table, key: &str) -> Result<Option<Row>>;

  /// Insert or replace a row.
  fn put(&self, table: Table, row: Row) -> Result<()>;

  /// Remove a row. Returns whether it existed.
  fn delete(&self, table: Table, key: &str) -> Result<bool>;

  /// Insert or replace many rows in one transaction.
  fn bulk_put(&self, table: Table, rows: Vec<Row>) -> Result<()>;

  /// All rows whose entity type matches, in primary key order.
  fn query_index(&self, table: Table, entity_type: &str) -> Result<Vec<Row>>;

  /// All rows in primary key order.
  fn scan(&self, table: Table) -> Result<Vec<Row>>;

  /// Remove every row. Returns the number removed.
  fn clear(&self, table: Table) -> Result<usize>;
}
