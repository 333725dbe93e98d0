//! In-process storage for tests and sessions that should not persist.

use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{DurableStore, Row, Table};

/// Storage that keeps every table in memory.
///
/// `set_failing(true)` makes every call return an error, which is how tests
/// simulate a full quota or a corrupted database.
#[derive(Debug, Default)]
pub struct MemoryStore {
  tables: Mutex<HashMap<Table, BTreeMap<String, Row>>>,
  failing: AtomicBool,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_failing(&self, failing: bool) {
    self.failing.store(failing, Ordering::SeqCst);
  }

  fn with_table<T>(
    &self,
    table: Table,
    f: impl FnOnce(&mut BTreeMap<String, Row>) -> T,
  ) -> Result<T> {
    if self.failing.load(Ordering::SeqCst) {
      return Err(eyre!("{} is unavailable", table.name()));
    }
    let mut tables = self
      .tables
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(tables.entry(table).or_default()))
  }
}

impl DurableStore for MemoryStore {
  fn get(&self, table: Table, key: &str) -> Result<Option<Row>> {
    self.with_table(table, |rows| rows.get(key).cloned())
  }

  fn put(&self, table: Table, row: Row) -> Result<()> {
    self.with_table(table, |rows| {
      rows.insert(row.key.clone(), row);
    })
  }

  fn delete(&self, table: Table, key: &str) -> Result<bool> {
    self.with_table(table, |rows| rows.remove(key).is_some())
  }

  fn bulk_put(&self, table: Table, new_rows: Vec<Row>) -> Result<()> {
    self.with_table(table, |rows| {
      for row in new_rows {
        rows.insert(row.key.clone(), row);
      }
    })
  }

  fn query_index(&self, table: Table, entity_type: &str) -> Result<Vec<Row>> {
    self.with_table(table, |rows| {
      rows
        .values()
        .filter(|row| row.entity_type.as_deref() == Some(entity_type))
        .cloned()
        .collect()
    })
  }

  fn scan(&self, table: Table) -> Result<Vec<Row>> {
    self.with_table(table, |rows| rows.values().cloned().collect())
  }

  fn clear(&self, table: Table) -> Result<usize> {
    self.with_table(table, |rows| {
      let removed = rows.len();
      rows.clear();
      removed
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_tables_are_independent() {
    let store = MemoryStore::new();
    store
      .put(Table::CacheMetadata, Row::new("a", None, b"1".to_vec()))
      .unwrap();

    assert!(store.get(Table::SyncQueue, "a").unwrap().is_none());
    assert!(store.get(Table::CacheMetadata, "a").unwrap().is_some());
  }

  #[test]
  fn test_failing_mode_errors() {
    let store = MemoryStore::new();
    store.set_failing(true);
    assert!(store.scan(Table::SyncQueue).is_err());

    store.set_failing(false);
    assert!(store.scan(Table::SyncQueue).unwrap().is_empty());
  }
}
