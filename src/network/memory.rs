use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};

use super::{NetworkError, RemoteStore, Subscription};
use crate::model::{ChangeEvent, ChangeKind, SyncRecord};

const SUBSCRIPTION_BUFFER: usize = 64;

/// In-process backend with failure injection.
///
/// Used by the test suite and for running the engine without a server. Every
/// write made through `put` or `insert` is echoed to the collection's
/// subscribers, like a realtime backend would.
#[derive(Default)]
pub struct MemoryRemoteStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, BTreeMap<String, SyncRecord>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<ChangeEvent>>>,
    subscribe_calls: HashMap<String, usize>,
    offline: bool,
    put_failures: usize,
    send_failures: HashMap<Vec<u8>, usize>,
    put_log: Vec<(String, String)>,
    send_log: VecDeque<(String, Vec<u8>)>,
    delivered: Vec<(String, Vec<u8>)>,
    fetch_delay: Option<Duration>,
    active_fetches: HashMap<String, usize>,
    max_active_fetches: HashMap<String, usize>,
}

impl Inner {
    fn check_online(&self) -> Result<(), NetworkError> {
        if self.offline {
            return Err(NetworkError::ConnectionError("remote unreachable".to_string()));
        }
        Ok(())
    }

    fn notify(&mut self, collection: &str, record: &SyncRecord) {
        let Some(senders) = self.subscribers.get_mut(collection) else {
            return;
        };
        let event = ChangeEvent {
            collection: collection.to_string(),
            kind: ChangeKind::Put,
            path: format!("/{}", record.id),
            data: serde_json::to_value(record).unwrap_or(Value::Null),
        };
        senders.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a record as another replica would.
    pub async fn insert(&self, collection: &str, record: SyncRecord) {
        let mut inner = self.inner.lock().await;
        let record = record.clean();
        inner.notify(collection, &record);
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub async fn record(&self, collection: &str, id: &str) -> Option<SyncRecord> {
        let inner = self.inner.lock().await;
        inner.collections.get(collection)?.get(id).cloned()
    }

    pub async fn records(&self, collection: &str) -> Vec<SyncRecord> {
        let inner = self.inner.lock().await;
        inner
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn set_online(&self, online: bool) {
        let mut inner = self.inner.lock().await;
        inner.offline = !online;
        if !online {
            inner.subscribers.clear();
        }
    }

    /// Drop every open change stream of `collection`, as a server restart
    /// would.
    pub async fn disconnect(&self, collection: &str) {
        self.inner.lock().await.subscribers.remove(collection);
    }

    pub async fn fail_next_puts(&self, count: usize) {
        self.inner.lock().await.put_failures = count;
    }

    /// Make the next `count` deliveries of `payload` fail.
    pub async fn fail_sends_of(&self, payload: &[u8], count: usize) {
        self.inner
            .lock()
            .await
            .send_failures
            .insert(payload.to_vec(), count);
    }

    pub async fn set_fetch_delay(&self, delay: Duration) {
        self.inner.lock().await.fetch_delay = Some(delay);
    }

    /// `(collection, id)` of every successful put, in order.
    pub async fn put_log(&self) -> Vec<(String, String)> {
        self.inner.lock().await.put_log.clone()
    }

    /// Every delivery attempt, successful or not, in order.
    pub async fn send_attempts(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().await.send_log.iter().cloned().collect()
    }

    pub async fn delivered(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().await.delivered.clone()
    }

    pub async fn subscribe_calls(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .await
            .subscribe_calls
            .get(collection)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of overlapping fetches seen for `collection`.
    pub async fn max_concurrent_fetches(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .await
            .max_active_fetches
            .get(collection)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch(&self, collection: &str) -> Result<Vec<SyncRecord>, NetworkError> {
        let delay = {
            let mut inner = self.inner.lock().await;
            inner.check_online()?;
            let active = inner.active_fetches.entry(collection.to_string()).or_default();
            *active += 1;
            let now = *active;
            let max = inner
                .max_active_fetches
                .entry(collection.to_string())
                .or_default();
            *max = (*max).max(now);
            inner.fetch_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock().await;
        if let Some(active) = inner.active_fetches.get_mut(collection) {
            *active -= 1;
        }
        inner.check_online()?;
        Ok(inner
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put(&self, collection: &str, record: &SyncRecord) -> Result<(), NetworkError> {
        let mut inner = self.inner.lock().await;
        inner.check_online()?;
        if inner.put_failures > 0 {
            inner.put_failures -= 1;
            return Err(NetworkError::TimeoutError);
        }

        let record = record.clone().clean();
        inner
            .put_log
            .push((collection.to_string(), record.id.clone()));
        inner.notify(collection, &record);
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn subscribe(&self, collection: &str) -> Result<Subscription, NetworkError> {
        let mut inner = self.inner.lock().await;
        *inner
            .subscribe_calls
            .entry(collection.to_string())
            .or_default() += 1;
        inner.check_online()?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        inner
            .subscribers
            .entry(collection.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(rx))
    }

    async fn send(&self, topic: &str, payload: &[u8]) -> Result<(), NetworkError> {
        let mut inner = self.inner.lock().await;
        inner
            .send_log
            .push_back((topic.to_string(), payload.to_vec()));
        inner.check_online()?;

        if let Some(remaining) = inner.send_failures.get_mut(payload) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(NetworkError::ConnectionError("connection reset".to_string()));
            }
        }

        inner.delivered.push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn probe(&self) -> bool {
        !self.inner.lock().await.offline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn absent_collection_fetches_empty() {
        let remote = MemoryRemoteStore::new();
        assert!(remote.fetch("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_is_idempotent_per_id() {
        let remote = MemoryRemoteStore::new();
        let record = SyncRecord::local("c1", json!({"name": "v1"}), 1);
        remote.put("companies", &record).await.unwrap();

        let newer = SyncRecord::local("c1", json!({"name": "v2"}), 2);
        remote.put("companies", &newer).await.unwrap();
        remote.put("companies", &newer).await.unwrap();

        let records = remote.records("companies").await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data["name"], "v2");
        assert!(!records[0].is_dirty);
    }

    #[tokio::test]
    async fn subscribers_see_writes_until_disconnected() {
        let remote = MemoryRemoteStore::new();
        let mut sub = remote.subscribe("companies").await.unwrap();

        remote
            .insert("companies", SyncRecord::remote("c1", json!({}), 1))
            .await;
        let event = sub.next().await.unwrap();
        assert_eq!(event.path, "/c1");

        remote.disconnect("companies").await;
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn offline_remote_rejects_calls() {
        let remote = MemoryRemoteStore::new();
        remote.set_online(false).await;
        assert!(remote.fetch("c").await.is_err());
        assert!(remote.subscribe("c").await.is_err());
        assert!(!remote.probe().await);
    }
}
