//! Background tasks.
//!
//! # Tasks
//! - Sync: drains the mutation queue when connectivity returns and
//!   periodically while the server is reachable

mod sync;

pub use sync::spawn_sync_task;
