use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{sort_fifo, LocalStore, OutboxStore, StorageError};
use crate::common::timestamp::now_ms;
use crate::model::{OutboxItem, SyncRecord};

/// Volatile store for tests and for hosts that keep their own persistence.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, SyncRecord>>>,
    outbox: RwLock<BTreeMap<u64, OutboxItem>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue with an explicit creation time.
    pub async fn enqueue_at(&self, topic: &str, payload: Vec<u8>, created_at_ms: u64) -> OutboxItem {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let item = OutboxItem::new(id, topic, payload, created_at_ms);
        self.outbox.write().await.insert(id, item.clone());
        item
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<SyncRecord>, StorageError> {
        let guard = self.collections.read().await;
        Ok(guard.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn list(&self, collection: &str) -> Result<Vec<SyncRecord>, StorageError> {
        let guard = self.collections.read().await;
        Ok(guard
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, collection: &str, record: SyncRecord) -> Result<(), StorageError> {
        let mut guard = self.collections.write().await;
        guard
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        let mut guard = self.collections.write().await;
        if let Some(c) = guard.get_mut(collection) {
            c.remove(id);
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryStore {
    async fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<OutboxItem, StorageError> {
        Ok(self.enqueue_at(topic, payload, now_ms()).await)
    }

    async fn get(&self, id: u64) -> Result<Option<OutboxItem>, StorageError> {
        Ok(self.outbox.read().await.get(&id).cloned())
    }

    async fn pending(&self) -> Result<Vec<OutboxItem>, StorageError> {
        let mut items: Vec<OutboxItem> = self
            .outbox
            .read()
            .await
            .values()
            .filter(|item| !item.is_sent)
            .cloned()
            .collect();
        sort_fifo(&mut items);
        Ok(items)
    }

    async fn record_attempt(&self, id: u64) -> Result<u32, StorageError> {
        let mut guard = self.outbox.write().await;
        let item = guard
            .get_mut(&id)
            .ok_or(StorageError::OutboxItemNotFound(id))?;
        item.attempts += 1;
        Ok(item.attempts)
    }

    async fn mark_sent(&self, id: u64, sent_at_ms: u64) -> Result<(), StorageError> {
        let mut guard = self.outbox.write().await;
        let item = guard
            .get_mut(&id)
            .ok_or(StorageError::OutboxItemNotFound(id))?;
        item.is_sent = true;
        item.sent_at_ms = Some(sent_at_ms);
        Ok(())
    }

    async fn reset_attempts(&self, id: u64) -> Result<(), StorageError> {
        let mut guard = self.outbox.write().await;
        let item = guard
            .get_mut(&id)
            .ok_or(StorageError::OutboxItemNotFound(id))?;
        item.attempts = 0;
        Ok(())
    }

    async fn remove(&self, id: u64) -> Result<bool, StorageError> {
        Ok(self.outbox.write().await.remove(&id).is_some())
    }

    async fn remove_sent(&self) -> Result<usize, StorageError> {
        let mut guard = self.outbox.write().await;
        let before = guard.len();
        guard.retain(|_, item| !item.is_sent);
        Ok(before - guard.len())
    }
}
