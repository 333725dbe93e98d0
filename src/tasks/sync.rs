//! Queue drain trigger.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::connectivity::{ConnectivityMonitor, LinkState};
use crate::queue::MutationQueue;
use crate::remote::RemoteClient;
use crate::store::DurableStore;

/// Spawns a background task that drains the queue.
///
/// A drain runs whenever the monitor reports a transition into LIVE, and on
/// every `interval` tick while the server is reachable. Abort the returned
/// handle at shutdown.
pub fn spawn_sync_task<S, R>(
  queue: Arc<MutationQueue<S, R>>,
  monitor: ConnectivityMonitor<R>,
  interval: Duration,
) -> JoinHandle<()>
where
  S: DurableStore + 'static,
  R: RemoteClient,
{
  tokio::spawn(async move {
    info!("Starting sync task with interval of {:?}", interval);

    let mut link = monitor.subscribe();
    let mut previous = *link.borrow_and_update();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        changed = link.changed() => {
          if changed.is_err() {
            debug!("connectivity monitor dropped, stopping sync task");
            break;
          }
          let current = *link.borrow_and_update();
          if current == LinkState::Live && previous != LinkState::Live {
            info!(from = ?previous, "connectivity restored, draining queue");
            run_drain(&queue).await;
          }
          previous = current;
        }
        _ = ticker.tick() => {
          if !monitor.is_degraded().await {
            run_drain(&queue).await;
          }
        }
      }
    }
  })
}

async fn run_drain<S: DurableStore, R: RemoteClient>(queue: &MutationQueue<S, R>) {
  let report = queue.drain().await;
  if report.skipped.is_none() && !report.replayed.is_empty() {
    info!(replayed = report.replayed.len(), "queued mutations synced");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheStore;
  use crate::clock::ManualClock;
  use crate::config::{ConnectivityConfig, QueueConfig, ServerConfig};
  use crate::connectivity::DegradedModeOverride;
  use crate::queue::MutationAction;
  use crate::remote::RemoteErrorKind;
  use crate::store::MemoryStore;
  use crate::testing::FakeRemote;
  use serde_json::Value;

  fn setup(
    remote: Arc<FakeRemote>,
  ) -> (
    Arc<MutationQueue<MemoryStore, FakeRemote>>,
    ConnectivityMonitor<FakeRemote>,
  ) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at_epoch());
    let monitor = ConnectivityMonitor::new(
      remote.clone(),
      clock.clone(),
      DegradedModeOverride::default(),
      &ConnectivityConfig::default(),
      &ServerConfig::default(),
    );
    let queue = Arc::new(MutationQueue::new(
      store.clone(),
      remote,
      monitor.clone(),
      CacheStore::new(store, clock.clone()),
      clock,
      &QueueConfig::default(),
    ));
    (queue, monitor)
  }

  async fn wait_until_empty(queue: &MutationQueue<MemoryStore, FakeRemote>) -> bool {
    for _ in 0..100 {
      if queue.all().unwrap().is_empty() {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  #[tokio::test]
  async fn test_drains_when_connectivity_returns() {
    let remote = Arc::new(FakeRemote::new());
    remote.fail_path("/api/method/ping", RemoteErrorKind::Unreachable);
    let (queue, monitor) = setup(remote.clone());
    queue
      .enqueue("Item", "ITM-1", MutationAction::Create, Value::Null)
      .unwrap();

    let handle = spawn_sync_task(queue.clone(), monitor.clone(), Duration::from_secs(3600));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(queue.pending().unwrap().len(), 1);
    assert_eq!(monitor.link_state(), LinkState::Degraded);

    remote.heal_path("/api/method/ping");
    monitor.clear_cache();
    assert!(monitor.verdict(false).await.is_available);

    assert!(wait_until_empty(&queue).await);
    assert_eq!(remote.calls_to("/api/resource/Item"), 1);
    handle.abort();
  }

  #[tokio::test]
  async fn test_drains_periodically_while_live() {
    let remote = Arc::new(FakeRemote::new());
    let (queue, monitor) = setup(remote.clone());

    let handle = spawn_sync_task(queue.clone(), monitor, Duration::from_millis(30));
    tokio::time::sleep(Duration::from_millis(10)).await;

    queue
      .enqueue("Bin", "BIN-1", MutationAction::Update, Value::Null)
      .unwrap();
    assert!(wait_until_empty(&queue).await);
    handle.abort();
  }

  #[tokio::test]
  async fn test_sync_task_can_be_aborted() {
    let remote = Arc::new(FakeRemote::new());
    let (queue, monitor) = setup(remote);

    let handle = spawn_sync_task(queue, monitor, Duration::from_secs(1));
    handle.abort();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.is_finished(), "Task should be finished after abort");
  }
}
