use std::convert::TryInto;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{sort_fifo, LocalStore, OutboxStore, StorageError};
use crate::common::timestamp::now_ms;
use crate::model::{OutboxItem, SyncRecord};

const RECORD_TREE_PREFIX: &str = "records:";

/// Durable local store backed by sled.
///
/// Each collection lives in its own tree (`records:<collection>`) keyed by
/// record id, with JSON values. Outbox items live in a dedicated tree keyed by
/// a monotonically increasing sequence ID encoded big-endian, so iteration
/// order matches insertion order.
pub struct SledStore {
    db: sled::Db,
    outbox: sled::Tree,
    next_id: AtomicU64,
    // Serializes read-modify-write cycles on outbox entries.
    outbox_lock: Mutex<()>,
    path: PathBuf,
}

impl SledStore {
    const OUTBOX_TREE: &'static str = "__outbox__";
    const META_NEXT_ID_KEY: &'static [u8] = b"__next_id__";

    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StorageError> {
        let path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let db = sled::open(&path).map_err(|e| StorageError::SledError(e.to_string()))?;
        let outbox = db
            .open_tree(Self::OUTBOX_TREE)
            .map_err(|e| StorageError::SledError(e.to_string()))?;

        // Prefer the persisted next_id marker; otherwise recover it from the
        // highest numeric key present.
        let next_id = match outbox.get(Self::META_NEXT_ID_KEY)? {
            Some(bytes) => decode_id(&bytes).unwrap_or(0),
            None => {
                let mut last_id = 0;
                for item in outbox.iter() {
                    let (key, _value) = item?;
                    if let Some(id) = decode_id(&key) {
                        last_id = last_id.max(id);
                    }
                }
                last_id
            }
        };

        log::info!("Sled sync store initialized at {:?}", path);

        Ok(Self {
            db,
            outbox,
            next_id: AtomicU64::new(next_id),
            outbox_lock: Mutex::new(()),
            path,
        })
    }

    fn record_tree(&self, collection: &str) -> Result<sled::Tree, StorageError> {
        self.db
            .open_tree(format!("{RECORD_TREE_PREFIX}{collection}"))
            .map_err(|e| StorageError::SledError(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of every collection that has been written locally.
    pub fn collections(&self) -> Vec<String> {
        self.db
            .tree_names()
            .into_iter()
            .filter_map(|name| {
                let name = String::from_utf8(name.to_vec()).ok()?;
                name.strip_prefix(RECORD_TREE_PREFIX).map(str::to_string)
            })
            .collect()
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn read_item(&self, id: u64) -> Result<Option<OutboxItem>, StorageError> {
        match self.outbox.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_item(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_item(&self, item: &OutboxItem) -> Result<(), StorageError> {
        let bytes = bincode::serde::encode_to_vec(item, bincode::config::standard())
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        self.outbox.insert(item.id.to_be_bytes(), bytes)?;
        Ok(())
    }

    async fn update_item<F>(&self, id: u64, f: F) -> Result<OutboxItem, StorageError>
    where
        F: FnOnce(&mut OutboxItem) + Send,
    {
        let _guard = self.outbox_lock.lock().await;
        let mut item = self
            .read_item(id)?
            .ok_or(StorageError::OutboxItemNotFound(id))?;
        f(&mut item);
        self.write_item(&item)?;
        self.outbox.flush_async().await?;
        Ok(item)
    }

    fn items(&self) -> Result<Vec<OutboxItem>, StorageError> {
        let mut items = Vec::new();
        for entry in self.outbox.iter() {
            let (key, value) = entry?;
            // Only 8-byte keys are queued items; anything else is metadata.
            if key.len() != 8 {
                continue;
            }
            items.push(decode_item(&value)?);
        }
        Ok(items)
    }
}

fn decode_id(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

fn decode_item(bytes: &[u8]) -> Result<OutboxItem, StorageError> {
    let (item, _): (OutboxItem, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
    Ok(item)
}

#[async_trait]
impl LocalStore for SledStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<SyncRecord>, StorageError> {
        let tree = self.record_tree(collection)?;
        match tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, collection: &str) -> Result<Vec<SyncRecord>, StorageError> {
        let tree = self.record_tree(collection)?;
        let mut records = Vec::new();
        for item in tree.iter() {
            let (_key, value) = item?;
            records.push(serde_json::from_slice(&value)?);
        }
        Ok(records)
    }

    async fn upsert(&self, collection: &str, record: SyncRecord) -> Result<(), StorageError> {
        let tree = self.record_tree(collection)?;
        let bytes = serde_json::to_vec(&record)?;
        tree.insert(record.id.as_bytes(), bytes)?;
        tree.flush_async().await?;
        log::debug!(
            "Upserted record '{}' into '{}' (dirty={}, deleted={})",
            record.id,
            collection,
            record.is_dirty,
            record.is_deleted
        );
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        let tree = self.record_tree(collection)?;
        tree.remove(id.as_bytes())?;
        tree.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for SledStore {
    async fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<OutboxItem, StorageError> {
        let _guard = self.outbox_lock.lock().await;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let item = OutboxItem::new(id, topic, payload, now_ms());

        self.write_item(&item)?;
        // Persist the sequence so ids never reset, even once the queue drains.
        self.outbox
            .insert(Self::META_NEXT_ID_KEY, id.to_be_bytes().to_vec())?;
        self.outbox.flush_async().await?;

        Ok(item)
    }

    async fn get(&self, id: u64) -> Result<Option<OutboxItem>, StorageError> {
        self.read_item(id)
    }

    async fn pending(&self) -> Result<Vec<OutboxItem>, StorageError> {
        let mut items = self.items()?;
        items.retain(|item| !item.is_sent);
        sort_fifo(&mut items);
        Ok(items)
    }

    async fn record_attempt(&self, id: u64) -> Result<u32, StorageError> {
        let item = self.update_item(id, |item| item.attempts += 1).await?;
        Ok(item.attempts)
    }

    async fn mark_sent(&self, id: u64, sent_at_ms: u64) -> Result<(), StorageError> {
        self.update_item(id, |item| {
            item.is_sent = true;
            item.sent_at_ms = Some(sent_at_ms);
        })
        .await?;
        Ok(())
    }

    async fn reset_attempts(&self, id: u64) -> Result<(), StorageError> {
        self.update_item(id, |item| item.attempts = 0).await?;
        Ok(())
    }

    async fn remove(&self, id: u64) -> Result<bool, StorageError> {
        let _guard = self.outbox_lock.lock().await;
        let removed = self.outbox.remove(id.to_be_bytes())?.is_some();
        self.outbox.flush_async().await?;
        Ok(removed)
    }

    async fn remove_sent(&self) -> Result<usize, StorageError> {
        let _guard = self.outbox_lock.lock().await;
        let mut removed = 0;
        for item in self.items()? {
            if item.is_sent {
                self.outbox.remove(item.id.to_be_bytes())?;
                removed += 1;
            }
        }
        self.outbox.flush_async().await?;
        Ok(removed)
    }
}
