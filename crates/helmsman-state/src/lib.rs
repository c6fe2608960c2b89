//! helmsman-state: durable record store for Helmsman rollouts.
//!
//! Backed by [redb](https://docs.rs/redb). Holds one `RolloutRecord` per
//! rollout/run attempt, keyed `{env}/{workload}/{id}`, plus the lock table
//! that decides which record of a workload is currently supervised.
//!
//! # Architecture
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.
//! Updates are read-modify-write closures executed inside a single write
//! transaction, so callers change individual fields without racing other
//! writers. Every committed update is published as a `ChangeEvent` on a
//! broadcast channel; `RecordStore::subscribe` hands out filtered
//! subscriptions.
//!
//! The `RecordStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod lock;
pub mod store;
pub mod tables;
pub mod types;
pub mod watch;

pub use error::{StateError, StateResult};
pub use lock::{LockAttempt, LockLease};
pub use store::RecordStore;
pub use types::*;
pub use watch::{Subscription, WatchFilter};
