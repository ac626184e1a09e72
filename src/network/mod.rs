//! Remote side of synchronization: the backend contract, its HTTP and
//! in-memory implementations, connectivity and status reporting.

mod error;
pub mod connectivity;
pub mod frame;
pub mod http_remote;
pub mod memory;
pub mod sync_status;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::model::{ChangeEvent, SyncRecord};

pub use connectivity::*;
pub use error::NetworkError;
pub use http_remote::HttpRemoteStore;
pub use memory::MemoryRemoteStore;
pub use sync_status::{StatusPublisher, SyncStatus};

/// Backend abstraction shared by the sync engine and the outbox.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// All records of a collection. An absent or empty collection yields an
    /// empty set, never an error.
    async fn fetch(&self, collection: &str) -> Result<Vec<SyncRecord>, NetworkError>;

    /// Idempotent write keyed by record id; the last write wins.
    async fn put(&self, collection: &str, record: &SyncRecord) -> Result<(), NetworkError>;

    /// Open a change stream for a collection. The stream ends (the receiver
    /// yields `None`) when the connection is lost.
    async fn subscribe(&self, collection: &str) -> Result<Subscription, NetworkError>;

    /// Deliver an outbox payload to `topic`.
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<(), NetworkError>;

    /// Cheap reachability check used by the connectivity monitor.
    async fn probe(&self) -> bool;
}

/// A live change stream. Dropping it cancels the underlying connection.
#[derive(Debug)]
pub struct Subscription {
    events: mpsc::Receiver<ChangeEvent>,
    cancel: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(events: mpsc::Receiver<ChangeEvent>) -> Self {
        Self {
            events,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: oneshot::Sender<()>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    /// Events already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        self.events.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
