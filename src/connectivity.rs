//! Connectivity monitor: is the document API usable right now?
//!
//! One lightweight probe answers for everyone. The verdict is reused for the
//! debounce window, and callers that arrive while a probe is in flight await
//! that same probe instead of starting their own. An operator override forces
//! degraded mode and skips probing entirely.

use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::{millis, Clock};
use crate::config::{ConnectivityConfig, ServerConfig};
use crate::remote::{RemoteCall, RemoteClient};

/// Operator switch for working offline on purpose (demo mode).
///
/// Clones share the flag, so the handle given to the UI and the one inside
/// the monitor always agree.
#[derive(Debug, Clone, Default)]
pub struct DegradedModeOverride(Arc<AtomicBool>);

impl DegradedModeOverride {
  pub fn new(forced: bool) -> Self {
    Self(Arc::new(AtomicBool::new(forced)))
  }

  pub fn set(&self, forced: bool) {
    self.0.store(forced, Ordering::SeqCst);
  }

  pub fn is_forced(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// Probe-level view of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
  /// No probe has completed yet
  Unknown,
  Live,
  Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectivityVerdict {
  pub is_available: bool,
  /// Always true when unavailable; also true while the override is set
  pub is_degraded_mode: bool,
  pub last_check: DateTime<Utc>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl ConnectivityVerdict {
  fn live(at: DateTime<Utc>) -> Self {
    Self {
      is_available: true,
      is_degraded_mode: false,
      last_check: at,
      error: None,
    }
  }

  fn unavailable(at: DateTime<Utc>, error: String) -> Self {
    Self {
      is_available: false,
      is_degraded_mode: true,
      last_check: at,
      error: Some(error),
    }
  }

  fn forced(at: DateTime<Utc>, is_available: bool) -> Self {
    Self {
      is_available,
      is_degraded_mode: true,
      last_check: at,
      error: None,
    }
  }

  pub fn link_state(&self) -> LinkState {
    if self.is_available {
      LinkState::Live
    } else {
      LinkState::Degraded
    }
  }
}

type ProbeFuture = Shared<BoxFuture<'static, ConnectivityVerdict>>;

#[derive(Default)]
struct ProbeState {
  verdict: Option<ConnectivityVerdict>,
  inflight: Option<ProbeFuture>,
  /// Bumped by `clear_cache`; results from older probes are discarded
  generation: u64,
}

struct Inner<R> {
  remote: Arc<R>,
  clock: Arc<dyn Clock>,
  degraded_override: DegradedModeOverride,
  debounce: Duration,
  probe_timeout: std::time::Duration,
  probe_path: String,
  state: Mutex<ProbeState>,
  link: watch::Sender<LinkState>,
}

impl<R> Inner<R> {
  fn lock(&self) -> std::sync::MutexGuard<'_, ProbeState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn record(&self, generation: u64, verdict: &ConnectivityVerdict) {
    let mut state = self.lock();
    if state.generation != generation {
      debug!("discarding probe result from before cache clear");
      return;
    }
    state.verdict = Some(verdict.clone());
    state.inflight = None;
    drop(state);

    let next = verdict.link_state();
    self.link.send_if_modified(|current| {
      if *current == next {
        return false;
      }
      let from = *current;
      info!(?from, to = ?next, error = ?verdict.error, "connectivity changed");
      *current = next;
      true
    });
  }
}

/// Throttled connectivity probe with a shared in-flight future.
pub struct ConnectivityMonitor<R: RemoteClient> {
  inner: Arc<Inner<R>>,
}

impl<R: RemoteClient> ConnectivityMonitor<R> {
  pub fn new(
    remote: Arc<R>,
    clock: Arc<dyn Clock>,
    degraded_override: DegradedModeOverride,
    config: &ConnectivityConfig,
    server: &ServerConfig,
  ) -> Self {
    let (link, _) = watch::channel(LinkState::Unknown);
    Self {
      inner: Arc::new(Inner {
        remote,
        clock,
        degraded_override,
        debounce: millis(config.debounce_ms),
        probe_timeout: std::time::Duration::from_millis(config.probe_timeout_ms),
        probe_path: server.probe_path.clone(),
        state: Mutex::new(ProbeState::default()),
        link,
      }),
    }
  }

  /// Current verdict, probing only when the cached one is too old.
  ///
  /// With `force_probe` the cached verdict is ignored, though an in-flight
  /// probe is still joined rather than duplicated.
  pub async fn verdict(&self, force_probe: bool) -> ConnectivityVerdict {
    let now = self.inner.clock.now();

    if self.inner.degraded_override.is_forced() {
      let last_available = self
        .inner
        .lock()
        .verdict
        .as_ref()
        .map(|v| v.is_available)
        .unwrap_or(false);
      return ConnectivityVerdict::forced(now, last_available);
    }

    let probe = {
      let mut state = self.inner.lock();

      if !force_probe {
        if let Some(verdict) = &state.verdict {
          if now - verdict.last_check < self.inner.debounce {
            return verdict.clone();
          }
        }
      }

      match &state.inflight {
        Some(probe) => probe.clone(),
        None => {
          let probe = Self::probe(Arc::clone(&self.inner), state.generation)
            .boxed()
            .shared();
          state.inflight = Some(probe.clone());
          probe
        }
      }
    };

    probe.await
  }

  /// Shorthand for `verdict(false).is_degraded_mode`.
  pub async fn is_degraded(&self) -> bool {
    self.verdict(false).await.is_degraded_mode
  }

  /// Forget the cached verdict so the next call probes again.
  pub fn clear_cache(&self) {
    let mut state = self.inner.lock();
    state.generation += 1;
    state.verdict = None;
    state.inflight = None;
    debug!("connectivity verdict cleared");
  }

  pub fn link_state(&self) -> LinkState {
    *self.inner.link.borrow()
  }

  /// Watch probe-level transitions (UNKNOWN/LIVE/DEGRADED).
  pub fn subscribe(&self) -> watch::Receiver<LinkState> {
    self.inner.link.subscribe()
  }

  pub fn degraded_override(&self) -> &DegradedModeOverride {
    &self.inner.degraded_override
  }

  async fn probe(inner: Arc<Inner<R>>, generation: u64) -> ConnectivityVerdict {
    debug!(path = %inner.probe_path, "probing connectivity");
    let call = RemoteCall::get(inner.probe_path.clone());
    let outcome = tokio::time::timeout(inner.probe_timeout, inner.remote.request::<Value>(call)).await;
    let now = inner.clock.now();

    let verdict = match outcome {
      Err(_) => ConnectivityVerdict::unavailable(
        now,
        format!("probe timed out after {:?}", inner.probe_timeout),
      ),
      Ok(response) => match response.into_result() {
        Ok(_) => ConnectivityVerdict::live(now),
        Err(error) if error.is_transport() => ConnectivityVerdict::unavailable(now, error.to_string()),
        Err(error) => {
          // Reachable but erroring: unavailable for this window only
          warn!(%error, "server reachable but probe failed");
          ConnectivityVerdict::unavailable(now, error.to_string())
        }
      },
    };

    inner.record(generation, &verdict);
    verdict
  }
}

impl<R: RemoteClient> Clone for ConnectivityMonitor<R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
