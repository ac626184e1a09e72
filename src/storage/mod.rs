//! Local persistence consumed by the sync engine and the outbox.
//!
//! Implementations must tolerate concurrent readers alongside one writer per
//! collection; the engine serializes writes per collection itself.

mod error;
pub mod memory;
pub mod sled_store;

use async_trait::async_trait;

use crate::model::{OutboxItem, SyncRecord};

pub use self::error::StorageError;
pub use self::memory::MemoryStore;
pub use self::sled_store::SledStore;

#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<SyncRecord>, StorageError>;

    async fn list(&self, collection: &str) -> Result<Vec<SyncRecord>, StorageError>;

    async fn list_dirty(&self, collection: &str) -> Result<Vec<SyncRecord>, StorageError> {
        let mut records = self.list(collection).await?;
        records.retain(|r| r.is_dirty);
        Ok(records)
    }

    async fn upsert(&self, collection: &str, record: SyncRecord) -> Result<(), StorageError>;

    /// Physical removal. Deletions that must propagate go through tombstones.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError>;
}

/// Durable storage behind the outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new unsent item and return it with its assigned id.
    async fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<OutboxItem, StorageError>;

    async fn get(&self, id: u64) -> Result<Option<OutboxItem>, StorageError>;

    /// Unsent items in delivery order (`created_at_ms`, then `id`).
    async fn pending(&self) -> Result<Vec<OutboxItem>, StorageError>;

    /// Bump the attempt counter, returning the new value.
    async fn record_attempt(&self, id: u64) -> Result<u32, StorageError>;

    async fn mark_sent(&self, id: u64, sent_at_ms: u64) -> Result<(), StorageError>;

    async fn reset_attempts(&self, id: u64) -> Result<(), StorageError>;

    /// Remove an item regardless of state. Returns false if it did not exist.
    async fn remove(&self, id: u64) -> Result<bool, StorageError>;

    /// Drop every delivered item, returning how many were removed.
    async fn remove_sent(&self) -> Result<usize, StorageError>;

    async fn pending_count(&self) -> Result<usize, StorageError> {
        Ok(self.pending().await?.len())
    }
}

pub(crate) fn sort_fifo(items: &mut [OutboxItem]) {
    items.sort_by_key(|item| (item.created_at_ms, item.id));
}
