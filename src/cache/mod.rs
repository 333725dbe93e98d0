//! TTL cache over the durable store.
//!
//! This module provides:
//! - `CacheEntry`, a payload stamped with `last_updated` and `expires_at`
//! - `CacheKey`, namespaced keys whose entity type feeds the secondary index
//! - `CacheStore`, which absorbs storage failures and degrades to "always miss"
//! - `Resolved`, the read result that records which tier produced the data

mod entry;
mod key;
mod result;
mod store;

pub use entry::CacheEntry;
pub use key::{entity_type_of, CacheKey};
pub use result::{Resolved, Source};
pub use store::CacheStore;
pub(crate) use store::validate_key;

/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 512;
