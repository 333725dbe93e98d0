//! Composition root: every component built once, shared by handle.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, DegradedModeOverride};
use crate::counts::CountAggregator;
use crate::fallback::FallbackDataset;
use crate::queue::MutationQueue;
use crate::remote::{HttpRemoteClient, RemoteClient};
use crate::resolver::FallbackResolver;
use crate::store::{DurableStore, SqliteStore};

/// The offline layer, wired together.
pub struct SyncCore<S: DurableStore, R: RemoteClient> {
  cache: CacheStore<S>,
  monitor: ConnectivityMonitor<R>,
  resolver: Arc<FallbackResolver<S, R>>,
  queue: Arc<MutationQueue<S, R>>,
  counts: Arc<CountAggregator<S, R>>,
}

impl<S: DurableStore, R: RemoteClient> SyncCore<S, R> {
  pub fn new(
    config: &Config,
    store: Arc<S>,
    remote: Arc<R>,
    clock: Arc<dyn Clock>,
    dataset: FallbackDataset,
  ) -> Self {
    let degraded = DegradedModeOverride::new(config.connectivity.degraded_mode);
    let cache = CacheStore::new(Arc::clone(&store), Arc::clone(&clock));
    let monitor = ConnectivityMonitor::new(
      Arc::clone(&remote),
      Arc::clone(&clock),
      degraded,
      &config.connectivity,
      &config.server,
    );
    let resolver = Arc::new(FallbackResolver::new(
      cache.clone(),
      monitor.clone(),
      Arc::clone(&remote),
      Arc::new(dataset),
      &config.cache,
    ));
    let queue = Arc::new(MutationQueue::new(
      store,
      Arc::clone(&remote),
      monitor.clone(),
      cache.clone(),
      clock,
      &config.queue,
    ));
    let counts = Arc::new(CountAggregator::new(
      Arc::clone(&resolver),
      remote,
      &config.cache,
    ));

    Self {
      cache,
      monitor,
      resolver,
      queue,
      counts,
    }
  }

  pub fn cache(&self) -> &CacheStore<S> {
    &self.cache
  }

  pub fn monitor(&self) -> &ConnectivityMonitor<R> {
    &self.monitor
  }

  pub fn resolver(&self) -> &Arc<FallbackResolver<S, R>> {
    &self.resolver
  }

  pub fn queue(&self) -> &Arc<MutationQueue<S, R>> {
    &self.queue
  }

  pub fn counts(&self) -> &Arc<CountAggregator<S, R>> {
    &self.counts
  }

  pub fn degraded_override(&self) -> &DegradedModeOverride {
    self.monitor.degraded_override()
  }
}

impl SyncCore<SqliteStore, HttpRemoteClient> {
  /// Build the production stack from configuration.
  pub fn open(config: &Config) -> Result<Self> {
    let store = match &config.storage.path {
      Some(path) => SqliteStore::open(path)?,
      None => SqliteStore::open_default()?,
    };
    let remote = HttpRemoteClient::from_config(config)?;
    let dataset = match &config.fallback.dataset {
      Some(path) => FallbackDataset::from_path(path)?,
      None => FallbackDataset::empty(),
    };

    info!(
      server = config.server.url.as_deref().unwrap_or("<unset>"),
      degraded = config.connectivity.degraded_mode,
      "sync core ready"
    );

    Ok(Self::new(
      config,
      Arc::new(store),
      Arc::new(remote),
      Arc::new(SystemClock),
      dataset,
    ))
  }
}
