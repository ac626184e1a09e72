//! Offline-first synchronization core.
//!
//! A local cache of records is reconciled with a remote backend through
//! periodic full passes and realtime change streams. Side effects that must
//! reach the backend go through a durable outbox.

pub mod common;
pub mod config;
pub mod model;
pub mod network;
pub mod storage;
pub mod sync;

// Public exports
pub use config::{ConfigError, SyncConfig};
pub use model::{ChangeEvent, ChangeKind, OutboxItem, SyncRecord};
pub use network::{
    ConnectivityMonitor, ConnectivitySignal, ConnectivityState, HttpRemoteStore, RemoteStore,
    SyncStatus,
};
pub use storage::{LocalStore, MemoryStore, OutboxStore, SledStore};
pub use sync::{Outbox, RetryPolicy, SyncEngine, SyncError};
