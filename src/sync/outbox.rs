//! Durable at-least-once delivery of side effects.
//!
//! Items are drained oldest first (`created_at_ms`, then id). A failed item
//! stays queued for the next flush; nothing is dropped unless an operator
//! purges it. Flushes never overlap: a flush requested while one is running
//! returns immediately with `skipped_busy` set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::{interval, MissedTickBehavior};

use super::retry::RetryPolicy;
use super::{shutdown_requested, SyncError};
use crate::common::timestamp::now_ms;
use crate::model::OutboxItem;
use crate::network::{ConnectivitySignal, RemoteStore};
use crate::storage::OutboxStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub skipped_busy: bool,
}

pub struct Outbox {
    store: Arc<dyn OutboxStore>,
    remote: Arc<dyn RemoteStore>,
    retry: RetryPolicy,
    dead_letter_after: Option<u32>,
    flushing: AtomicBool,
    flush_requested: Notify,
}

struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Outbox {
    pub fn new(store: Arc<dyn OutboxStore>, remote: Arc<dyn RemoteStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            remote,
            retry,
            dead_letter_after: None,
            flushing: AtomicBool::new(false),
            flush_requested: Notify::new(),
        }
    }

    /// Skip items once they reached `attempts` delivery attempts.
    pub fn with_dead_letter_after(mut self, attempts: Option<u32>) -> Self {
        self.dead_letter_after = attempts;
        self
    }

    pub async fn enqueue(&self, topic: &str, payload: Vec<u8>) -> Result<OutboxItem, SyncError> {
        let item = self.store.enqueue(topic, payload).await?;
        log::debug!("Outbox enqueued item {} for '{}'", item.id, item.topic);
        Ok(item)
    }

    pub async fn enqueue_json<T: Serialize>(&self, topic: &str, payload: &T) -> Result<OutboxItem, SyncError> {
        self.enqueue(topic, serde_json::to_vec(payload)?).await
    }

    pub async fn mark_sent(&self, id: u64) -> Result<(), SyncError> {
        self.store.mark_sent(id, now_ms()).await?;
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<usize, SyncError> {
        Ok(self.store.pending_count().await?)
    }

    pub async fn pending(&self) -> Result<Vec<OutboxItem>, SyncError> {
        Ok(self.store.pending().await?)
    }

    /// Operator purge: drop an item whatever its state.
    pub async fn purge(&self, id: u64) -> Result<bool, SyncError> {
        let removed = self.store.remove(id).await?;
        if removed {
            log::warn!("Outbox item {id} purged");
        }
        Ok(removed)
    }

    /// Give a dead-lettered item a fresh attempt budget.
    pub async fn requeue(&self, id: u64) -> Result<(), SyncError> {
        self.store.reset_attempts(id).await?;
        log::info!("Outbox item {id} requeued");
        Ok(())
    }

    /// Remove delivered items from storage.
    pub async fn prune_delivered(&self) -> Result<usize, SyncError> {
        Ok(self.store.remove_sent().await?)
    }

    /// Wake the `run` loop for an immediate flush.
    pub fn request_flush(&self) {
        self.flush_requested.notify_one();
    }

    fn is_dead_lettered(&self, item: &OutboxItem) -> bool {
        matches!(self.dead_letter_after, Some(limit) if item.attempts >= limit)
    }

    pub async fn flush(&self) -> Result<FlushReport, SyncError> {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("Outbox flush already in progress; skipping");
            return Ok(FlushReport {
                skipped_busy: true,
                ..FlushReport::default()
            });
        }
        let _guard = FlushGuard(&self.flushing);

        let mut report = FlushReport::default();
        for item in self.store.pending().await? {
            if self.is_dead_lettered(&item) {
                report.dead_lettered += 1;
                continue;
            }

            let store = &self.store;
            let remote = &self.remote;
            let current = &item;
            let label = format!("outbox item {} ({})", item.id, item.topic);
            let delivered = self
                .retry
                .execute(&label, || async move {
                    store.record_attempt(current.id).await?;
                    remote.send(&current.topic, &current.payload).await?;
                    Ok::<(), SyncError>(())
                })
                .await;

            match delivered {
                Ok(()) => {
                    self.store.mark_sent(item.id, now_ms()).await?;
                    report.delivered += 1;
                }
                Err(e) => {
                    log::warn!("Outbox item {} stays queued: {e}", item.id);
                    report.failed += 1;
                }
            }
        }

        if report.delivered + report.failed + report.dead_lettered > 0 {
            log::info!(
                "Outbox flush: delivered={}, failed={}, dead_lettered={}",
                report.delivered,
                report.failed,
                report.dead_lettered
            );
        }
        Ok(report)
    }

    /// Flush on every tick, on explicit requests and whenever connectivity is
    /// restored, until shutdown.
    pub async fn run(
        self: Arc<Self>,
        every: Duration,
        mut connectivity: Option<ConnectivitySignal>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                _ = ticker.tick() => "timer",
                _ = self.flush_requested.notified() => "request",
                restored = online_transition(&mut connectivity) => {
                    if !restored {
                        connectivity = None;
                        continue;
                    }
                    "connectivity"
                }
                _ = shutdown_requested(&mut shutdown) => return,
            };

            log::debug!("Outbox flush triggered by {trigger}");
            tokio::select! {
                res = self.flush() => {
                    if let Err(e) = res {
                        log::error!("Outbox flush failed: {e}");
                    }
                }
                _ = shutdown_requested(&mut shutdown) => return,
            }
        }
    }
}

pub(crate) async fn online_transition(signal: &mut Option<ConnectivitySignal>) -> bool {
    match signal {
        Some(signal) => signal.online_transition().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryRemoteStore;
    use crate::storage::MemoryStore;

    fn outbox(store: Arc<MemoryStore>, remote: Arc<MemoryRemoteStore>, attempts: u32) -> Outbox {
        Outbox::new(store, remote, RetryPolicy::new(attempts, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn failed_item_is_retried_on_next_flush_in_fifo_order() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let outbox = outbox(store.clone(), remote.clone(), 1);

        store.enqueue_at("push", b"one".to_vec(), 10).await;
        let two = store.enqueue_at("push", b"two".to_vec(), 20).await;
        store.enqueue_at("push", b"three".to_vec(), 30).await;
        remote.fail_sends_of(b"two", 1).await;

        let first = outbox.flush().await.unwrap();
        assert_eq!(first.delivered, 2);
        assert_eq!(first.failed, 1);
        assert_eq!(outbox.pending_count().await.unwrap(), 1);

        let second = outbox.flush().await.unwrap();
        assert_eq!(second.delivered, 1);
        assert_eq!(outbox.pending_count().await.unwrap(), 0);

        let attempted: Vec<Vec<u8>> = remote
            .send_attempts()
            .await
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        assert_eq!(
            attempted,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec(), b"two".to_vec()]
        );

        let stored = OutboxStore::get(store.as_ref(), two.id).await.unwrap().unwrap();
        assert!(stored.is_sent);
        assert_eq!(stored.attempts, 2);
    }

    #[tokio::test]
    async fn offline_remote_keeps_everything_queued() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_online(false).await;
        let outbox = outbox(store.clone(), remote.clone(), 2);

        outbox.enqueue("audit", b"a".to_vec()).await.unwrap();
        let report = outbox.flush().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(outbox.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dead_lettered_items_are_skipped_until_requeued() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let outbox = outbox(store.clone(), remote.clone(), 1).with_dead_letter_after(Some(2));

        let item = outbox.enqueue("push", b"poison".to_vec()).await.unwrap();
        remote.fail_sends_of(b"poison", 10).await;

        outbox.flush().await.unwrap();
        outbox.flush().await.unwrap();
        let report = outbox.flush().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(remote.send_attempts().await.len(), 2);
        assert_eq!(outbox.pending_count().await.unwrap(), 1);

        remote.fail_sends_of(b"poison", 0).await;
        outbox.requeue(item.id).await.unwrap();
        assert_eq!(outbox.flush().await.unwrap().delivered, 1);
    }

    #[tokio::test]
    async fn concurrent_flushes_are_coalesced() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let outbox = outbox(store.clone(), remote.clone(), 1);
        outbox.enqueue("push", b"x".to_vec()).await.unwrap();

        outbox.flushing.store(true, Ordering::SeqCst);
        assert!(outbox.flush().await.unwrap().skipped_busy);
        outbox.flushing.store(false, Ordering::SeqCst);

        let (a, b) = tokio::join!(outbox.flush(), outbox.flush());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.delivered + b.delivered, 1);
        assert_eq!(remote.delivered().await.len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_item_for_good() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let outbox = outbox(store, remote, 1);

        let item = outbox.enqueue("push", b"x".to_vec()).await.unwrap();
        assert!(outbox.purge(item.id).await.unwrap());
        assert!(!outbox.purge(item.id).await.unwrap());
        assert_eq!(outbox.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn run_flushes_on_request_and_connectivity_restore() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(MemoryRemoteStore::new());
        let outbox = Arc::new(outbox(store, remote.clone(), 1));
        let (handle, signal) = ConnectivitySignal::manual(false);
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(
            outbox
                .clone()
                .run(Duration::from_secs(3600), Some(signal), stop_rx),
        );
        // Let the immediate first tick pass.
        tokio::time::sleep(Duration::from_millis(20)).await;

        outbox.enqueue("push", b"a".to_vec()).await.unwrap();
        outbox.request_flush();
        wait_until_delivered(&remote, 1).await;

        outbox.enqueue("push", b"b".to_vec()).await.unwrap();
        handle.set_online(true);
        wait_until_delivered(&remote, 2).await;

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    async fn wait_until_delivered(remote: &MemoryRemoteStore, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while remote.delivered().await.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outbox never delivered");
    }
}
