//! Offline resilience and sync for a warehouse document API.
//!
//! Reads go through [`FallbackResolver`], which prefers a fresh cache entry,
//! then the server, then a bundled dataset, then whatever stale entry is left.
//! Writes made while offline wait in the durable [`MutationQueue`] and are
//! replayed in order once [`ConnectivityMonitor`] sees the server again.

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod counts;
pub mod error;
pub mod fallback;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod resolver;
pub mod store;
pub mod tasks;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, CacheKey, CacheStore, Resolved, Source};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use connectivity::{ConnectivityMonitor, ConnectivityVerdict, DegradedModeOverride, LinkState};
pub use engine::SyncCore;
pub use counts::{CountAggregator, CountRecord};
pub use error::{Result, SyncError};
pub use fallback::FallbackDataset;
pub use queue::{MutationAction, MutationQueue, MutationRecord, MutationStatus, QueueEvent};
pub use remote::{HttpRemoteClient, RemoteCall, RemoteClient, RemoteError, RemoteErrorKind, RemoteResponse};
pub use resolver::{FallbackResolver, ReadRequest};
pub use store::{DurableStore, MemoryStore, SqliteStore};
