//! End-to-end flows through the composed core: offline reads, durable
//! queueing across restarts and replay once the server is back.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use depot_sync::queue::DrainSkip;
use depot_sync::remote::Method;
use depot_sync::{
  Config, FallbackDataset, ManualClock, MemoryStore, MutationAction, RemoteCall, RemoteClient,
  RemoteError, RemoteErrorKind, RemoteResponse, Source, SqliteStore, SyncCore,
};

const PING: &str = "/api/method/ping";
const COUNT: &str = "/api/method/frappe.client.get_count";

/// A small document API that can be switched off.
#[derive(Default)]
struct ScriptedServer {
  offline: AtomicBool,
  lists: Mutex<HashMap<String, Value>>,
  broken_counts: Mutex<Vec<String>>,
  calls: Mutex<Vec<RemoteCall>>,
}

impl ScriptedServer {
  fn online() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn offline() -> Arc<Self> {
    let server = Self::default();
    server.offline.store(true, Ordering::SeqCst);
    Arc::new(server)
  }

  fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  fn serve_list(&self, entity_type: &str, docs: Value) {
    self
      .lists
      .lock()
      .unwrap()
      .insert(entity_type.to_string(), docs);
  }

  fn break_count(&self, entity_type: &str) {
    self.broken_counts.lock().unwrap().push(entity_type.to_string());
  }

  fn writes(&self) -> Vec<(Method, String)> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.method != Method::Get)
      .map(|c| (c.method, c.path.clone()))
      .collect()
  }

  fn reads_of(&self, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.method == Method::Get && c.path == path)
      .count()
  }

  fn answer(&self, call: &RemoteCall) -> Result<Value, RemoteError> {
    if self.offline.load(Ordering::SeqCst) {
      return Err(RemoteError::new(RemoteErrorKind::Unreachable, "connection refused"));
    }

    match (call.method, call.path.as_str()) {
      (Method::Get, PING) => Ok(json!("pong")),
      (Method::Get, COUNT) => {
        let doctype = call.params["doctype"].as_str().unwrap_or_default().to_string();
        if self.broken_counts.lock().unwrap().contains(&doctype) {
          return Err(RemoteError::new(RemoteErrorKind::Server(500), "count failed"));
        }
        let lists = self.lists.lock().unwrap();
        let count = lists
          .get(&doctype)
          .and_then(Value::as_array)
          .map(|docs| docs.len())
          .unwrap_or(0);
        Ok(json!(count))
      }
      (Method::Get, path) => {
        let entity_type = path.trim_start_matches("/api/resource/");
        self
          .lists
          .lock()
          .unwrap()
          .get(entity_type)
          .cloned()
          .ok_or_else(|| RemoteError::new(RemoteErrorKind::Server(404), "not found"))
      }
      (_, _) => Ok(call.params.clone()),
    }
  }
}

impl RemoteClient for ScriptedServer {
  async fn request<T>(&self, call: RemoteCall) -> RemoteResponse<T>
  where
    T: DeserializeOwned + Send + 'static,
  {
    self.calls.lock().unwrap().push(call.clone());
    match self.answer(&call) {
      Ok(value) => match serde_json::from_value(value) {
        Ok(data) => RemoteResponse::ok(data),
        Err(e) => RemoteResponse::err(RemoteError::new(RemoteErrorKind::Decode, e.to_string())),
      },
      Err(error) => RemoteResponse::err(error),
    }
  }
}

fn items() -> Value {
  json!([
    { "name": "ITM-001", "item_name": "Pallet wrap" },
    { "name": "ITM-002", "item_name": "Carton" }
  ])
}

fn open_core(
  db: &Path,
  server: &Arc<ScriptedServer>,
  clock: &Arc<ManualClock>,
  dataset: FallbackDataset,
) -> SyncCore<SqliteStore, ScriptedServer> {
  let store = SqliteStore::open(db).unwrap();
  SyncCore::new(
    &Config::default(),
    Arc::new(store),
    Arc::clone(server),
    clock.clone(),
    dataset,
  )
}

#[tokio::test]
async fn test_offline_writes_survive_restart_and_replay_in_order() {
  let dir = tempfile::tempdir().unwrap();
  let db = dir.path().join("sync.db");
  let clock = Arc::new(ManualClock::at_epoch());
  let server = ScriptedServer::offline();
  let dataset = FallbackDataset::from_value(json!({ "Item": items() })).unwrap();

  {
    let core = open_core(&db, &server, &clock, dataset);

    let resolved = core.resolver().list("Item", false).await.unwrap();
    assert_eq!(resolved.source, Source::Fallback);
    assert_eq!(resolved.data.unwrap().len(), 2);

    core
      .queue()
      .enqueue("Item", "ITM-009", MutationAction::Create, json!({ "item_name": "Tape" }))
      .unwrap();
    core
      .queue()
      .enqueue("Item", "ITM-009", MutationAction::Update, json!({ "item_name": "Red tape" }))
      .unwrap();

    let report = core.queue().drain().await;
    assert_eq!(report.skipped, Some(DrainSkip::Offline));
  }

  server.set_offline(false);
  let core = open_core(&db, &server, &clock, FallbackDataset::empty());
  assert_eq!(core.queue().pending().unwrap().len(), 2);

  let report = core.queue().drain().await;
  assert_eq!(report.skipped, None);
  assert_eq!(report.replayed.len(), 2);
  assert!(core.queue().all().unwrap().is_empty());
  assert_eq!(
    server.writes(),
    vec![
      (Method::Post, "/api/resource/Item".to_string()),
      (Method::Put, "/api/resource/Item/ITM-009".to_string()),
    ]
  );
}

#[tokio::test]
async fn test_cached_reads_outlive_the_connection() {
  let dir = tempfile::tempdir().unwrap();
  let db = dir.path().join("sync.db");
  let clock = Arc::new(ManualClock::at_epoch());
  let server = ScriptedServer::online();
  server.serve_list("Item", items());

  {
    let core = open_core(&db, &server, &clock, FallbackDataset::empty());
    let resolved = core.resolver().list("Item", false).await.unwrap();
    assert_eq!(resolved.source, Source::Remote);
  }

  server.set_offline(true);
  let core = open_core(&db, &server, &clock, FallbackDataset::empty());

  let resolved = core.resolver().list("Item", false).await.unwrap();
  assert_eq!(resolved.source, Source::Cache);
  assert_eq!(resolved.data, Some(items().as_array().unwrap().clone()));

  // Past the list TTL the entry is still served, marked stale.
  clock.advance(Duration::minutes(31));
  let resolved = core.resolver().list("Item", false).await.unwrap();
  assert_eq!(resolved.source, Source::Stale);
  assert_eq!(resolved.last_updated, Some(DateTime::<Utc>::UNIX_EPOCH));
}

#[tokio::test]
async fn test_replay_refreshes_cached_reads() {
  let clock = Arc::new(ManualClock::at_epoch());
  let server = ScriptedServer::online();
  server.serve_list("Item", items());
  let core = SyncCore::new(
    &Config::default(),
    Arc::new(MemoryStore::new()),
    Arc::clone(&server),
    clock.clone(),
    FallbackDataset::empty(),
  );

  core.resolver().list("Item", false).await.unwrap();
  core.resolver().list("Item", false).await.unwrap();
  assert_eq!(server.reads_of("/api/resource/Item"), 1);

  core
    .queue()
    .enqueue("Item", "ITM-001", MutationAction::Update, json!({ "item_name": "Stretch wrap" }))
    .unwrap();
  assert_eq!(core.queue().drain().await.replayed.len(), 1);

  let resolved = core.resolver().list("Item", false).await.unwrap();
  assert_eq!(resolved.source, Source::Remote);
  assert_eq!(server.reads_of("/api/resource/Item"), 2);
}

#[tokio::test]
async fn test_counts_keep_healthy_types_when_one_fails() {
  let clock = Arc::new(ManualClock::at_epoch());
  let server = ScriptedServer::online();
  server.serve_list("Item", items());
  server.serve_list("Bin", json!([]));
  server.break_count("Bin");
  let core = SyncCore::new(
    &Config::default(),
    Arc::new(MemoryStore::new()),
    Arc::clone(&server),
    clock.clone(),
    FallbackDataset::empty(),
  );

  let counts = core.counts().get_all_counts(&["Item", "Bin", "Item"]).await;

  assert_eq!(counts.len(), 1);
  assert_eq!(counts["Item"].count, 2);
  assert_eq!(counts["Item"].source, Source::Remote);
  assert_eq!(server.reads_of(COUNT), 2);
}

#[tokio::test]
async fn test_forced_degraded_mode_stays_off_the_network() {
  let clock = Arc::new(ManualClock::at_epoch());
  let server = ScriptedServer::online();
  server.serve_list("Item", items());
  let mut config = Config::default();
  config.connectivity.degraded_mode = true;
  let core = SyncCore::new(
    &config,
    Arc::new(MemoryStore::new()),
    Arc::clone(&server),
    clock.clone(),
    FallbackDataset::empty(),
  );

  core
    .queue()
    .enqueue("Item", "ITM-001", MutationAction::Complete, Value::Null)
    .unwrap();
  let resolved = core.resolver().list("Item", false).await.unwrap();
  let report = core.queue().drain().await;

  assert_eq!(resolved.source, Source::Empty);
  assert_eq!(report.skipped, Some(DrainSkip::Offline));
  assert!(server.calls.lock().unwrap().is_empty());

  core.degraded_override().set(false);
  assert_eq!(core.queue().drain().await.replayed.len(), 1);
}
