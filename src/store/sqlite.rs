//! SQLite-backed durable storage.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{DurableStore, Row, Table};

/// SQLite-based storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("depot-sync").join("sync.db"))
  }

  /// Run database migrations.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// WAL with full sync: a committed put is on disk before `put` returns.
const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;

CREATE TABLE IF NOT EXISTS cache_metadata (
    key TEXT PRIMARY KEY,
    entity_type TEXT,
    data BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_cache_metadata_entity_type
    ON cache_metadata(entity_type);

CREATE TABLE IF NOT EXISTS sync_queue (
    key TEXT PRIMARY KEY,
    entity_type TEXT,
    data BLOB NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_entity_type
    ON sync_queue(entity_type);
"#;

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
  Ok(Row {
    key: row.get(0)?,
    entity_type: row.get(1)?,
    data: row.get(2)?,
  })
}

fn upsert(conn: &Connection, table: Table, row: &Row) -> Result<()> {
  conn
    .execute(
      &format!(
        "INSERT OR REPLACE INTO {} (key, entity_type, data, written_at)
         VALUES (?, ?, ?, datetime('now'))",
        table.name()
      ),
      params![row.key, row.entity_type, row.data],
    )
    .map_err(|e| eyre!("Failed to write {} row {}: {}", table.name(), row.key, e))?;
  Ok(())
}

impl DurableStore for SqliteStore {
  fn get(&self, table: Table, key: &str) -> Result<Option<Row>> {
    let conn = self.lock()?;

    conn
      .query_row(
        &format!(
          "SELECT key, entity_type, data FROM {} WHERE key = ?",
          table.name()
        ),
        params![key],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} row {}: {}", table.name(), key, e))
  }

  fn put(&self, table: Table, row: Row) -> Result<()> {
    let conn = self.lock()?;
    upsert(&conn, table, &row)
  }

  fn delete(&self, table: Table, key: &str) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute(
        &format!("DELETE FROM {} WHERE key = ?", table.name()),
        params![key],
      )
      .map_err(|e| eyre!("Failed to delete {} row {}: {}", table.name(), key, e))?;

    Ok(removed > 0)
  }

  fn bulk_put(&self, table: Table, rows: Vec<Row>) -> Result<()> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for row in &rows {
      upsert(&tx, table, row)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn query_index(&self, table: Table, entity_type: &str) -> Result<Vec<Row>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT key, entity_type, data FROM {} WHERE entity_type = ? ORDER BY key",
        table.name()
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![entity_type], read_row)
      .map_err(|e| eyre!("Failed to query {}: {}", table.name(), e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read {} rows: {}", table.name(), e))?;

    Ok(rows)
  }

  fn scan(&self, table: Table) -> Result<Vec<Row>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT key, entity_type, data FROM {} ORDER BY key",
        table.name()
      ))
      .map_err(|e| eyre!("Failed to prepare scan: {}", e))?;

    let rows = stmt
      .query_map([], read_row)
      .map_err(|e| eyre!("Failed to scan {}: {}", table.name(), e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read {} rows: {}", table.name(), e))?;

    Ok(rows)
  }

  fn clear(&self, table: Table) -> Result<usize> {
    let conn = self.lock()?;

    conn
      .execute(&format!("DELETE FROM {}", table.name()), [])
      .map_err(|e| eyre!("Failed to clear {}: {}", table.name(), e))
  }
}
