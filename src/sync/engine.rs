//! Reconciliation across all watched collections.
//!
//! A full pass pushes dirty local records and then pulls the remote
//! collection; an incremental pass (triggered by a listener) only pulls.
//! Passes for one collection never overlap; different collections run
//! concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::listener::{ChangeBatch, ListenerState, RealtimeListener};
use super::notify::{LatchedSink, LogSink, NotificationSink};
use super::outbox::{online_transition, Outbox};
use super::retry::RetryPolicy;
use super::{shutdown_requested, SyncError};
use crate::common::timestamp::{now_ms, Clock};
use crate::config::SyncConfig;
use crate::model::SyncRecord;
use crate::network::{ConnectivitySignal, RemoteStore, StatusPublisher, SyncStatus};
use crate::storage::LocalStore;

/// Outcome of comparing a remote record with the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    TakeRemote,
    KeepLocal,
    /// Remote tombstone for a record this replica does not hold.
    Ignore,
}

/// Last-write-wins by `last_modified_ms`. Only a strictly newer remote
/// timestamp replaces an existing local copy; ties keep the local record.
pub fn resolve(local: Option<&SyncRecord>, remote: &SyncRecord) -> Resolution {
    match local {
        None if remote.is_deleted => Resolution::Ignore,
        None => Resolution::TakeRemote,
        Some(local) if remote.last_modified_ms > local.last_modified_ms => Resolution::TakeRemote,
        Some(_) => Resolution::KeepLocal,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    pub collection: String,
    pub kind: PassKind,
    pub pushed: usize,
    pub push_failed: usize,
    pub pulled: usize,
    pub kept_local: usize,
    pub error: Option<String>,
}

impl CollectionReport {
    fn new(collection: &str, kind: PassKind) -> Self {
        Self {
            collection: collection.to_string(),
            kind,
            pushed: 0,
            push_failed: 0,
            pulled: 0,
            kept_local: 0,
            error: None,
        }
    }

    fn fail(&mut self, message: String) {
        if self.error.is_none() {
            self.error = Some(message);
        }
    }
}

#[derive(Default)]
struct CollectionSlot {
    // Held for a whole reconciliation pass.
    pass: Mutex<()>,
    // Held around each local read-modify-write.
    write: Mutex<()>,
    pull_queued: AtomicBool,
}

struct Runtime {
    listeners: HashMap<String, RealtimeListener>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

struct QueuedPull<'a>(&'a AtomicBool);

impl Drop for QueuedPull<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct PassGuard<'a>(&'a StatusPublisher);

impl<'a> PassGuard<'a> {
    fn begin(status: &'a StatusPublisher) -> Self {
        status.begin_pass();
        Self(status)
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.end_pass();
    }
}

pub struct SyncEngine {
    local: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    retry: RetryPolicy,
    notifier: Arc<LatchedSink>,
    status: StatusPublisher,
    clock: Clock,
    slots: HashMap<String, Arc<CollectionSlot>>,
    outbox: Option<Arc<Outbox>>,
    connectivity: Option<ConnectivitySignal>,
    runtime: Mutex<Option<Runtime>>,
}

impl SyncEngine {
    pub fn new(local: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let notifier = Arc::new(LatchedSink::new(Arc::new(LogSink)));
        let slots = config
            .collections
            .iter()
            .map(|c| (c.clone(), Arc::new(CollectionSlot::default())))
            .collect();
        Self {
            local,
            remote,
            retry: Self::push_policy(&config, notifier.clone()),
            notifier,
            status: StatusPublisher::new(),
            clock: Clock::new(),
            slots,
            outbox: None,
            connectivity: None,
            runtime: Mutex::new(None),
            config,
        }
    }

    fn push_policy(config: &SyncConfig, notifier: Arc<LatchedSink>) -> RetryPolicy {
        RetryPolicy::new(config.push_max_attempts, config.push_base_delay()).with_sink(notifier)
    }

    /// Route terminal-failure notifications to `sink` (once per failure
    /// streak).
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Arc::new(LatchedSink::new(sink));
        self.retry = Self::push_policy(&self.config, self.notifier.clone());
        self
    }

    /// Run `outbox` alongside the engine and report its backlog in the status.
    pub fn with_outbox(mut self, outbox: Arc<Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Reconcile and flush the outbox whenever `signal` goes back online.
    pub fn with_connectivity(mut self, signal: ConnectivitySignal) -> Self {
        self.connectivity = Some(signal);
        self
    }

    pub fn collections(&self) -> &[String] {
        &self.config.collections
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn status_snapshot(&self) -> SyncStatus {
        self.status.snapshot()
    }

    pub fn outbox(&self) -> Option<&Arc<Outbox>> {
        self.outbox.as_ref()
    }

    fn slot(&self, collection: &str) -> Result<&Arc<CollectionSlot>, SyncError> {
        self.slots
            .get(collection)
            .ok_or_else(|| SyncError::UnknownCollection(collection.to_string()))
    }

    pub async fn is_running(&self) -> bool {
        self.runtime.lock().await.is_some()
    }

    pub async fn listener_state(&self, collection: &str) -> Option<ListenerState> {
        let runtime = self.runtime.lock().await;
        runtime
            .as_ref()
            .and_then(|r| r.listeners.get(collection))
            .map(RealtimeListener::state)
    }

    /// Start listeners, the full-sync ticker and, when attached, the outbox
    /// loop and connectivity watcher. Calling it on a running engine is a
    /// no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() {
            log::debug!("Sync engine already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let mut listeners: HashMap<String, RealtimeListener> = HashMap::new();

        for collection in &self.config.collections {
            listeners
                .entry(collection.clone())
                .or_insert_with(|| {
                    RealtimeListener::new(
                        collection.clone(),
                        Arc::clone(&self.remote),
                        batch_tx.clone(),
                        self.config.listener_reconnect_delay(),
                    )
                })
                .start();
        }

        let mut tasks = vec![
            tokio::spawn(Arc::clone(self).dispatch_changes(batch_rx, shutdown_rx.clone())),
            tokio::spawn(Arc::clone(self).run_ticker(shutdown_rx.clone())),
        ];

        if let Some(signal) = self.connectivity.clone() {
            tasks.push(tokio::spawn(
                Arc::clone(self).watch_connectivity(signal, shutdown_rx.clone()),
            ));
        }

        if let Some(outbox) = &self.outbox {
            tasks.push(tokio::spawn(Arc::clone(outbox).run(
                self.config.outbox_flush_interval(),
                self.connectivity.clone(),
                shutdown_rx.clone(),
            )));
        }

        log::info!(
            "Sync engine started for {} collection(s)",
            self.config.collections.len()
        );
        *runtime = Some(Runtime {
            listeners,
            shutdown: shutdown_tx,
            tasks,
        });
    }

    /// Cancel listeners and background tasks. Each is given
    /// `shutdown_timeout` to wind down before it is aborted.
    pub async fn stop(&self) {
        let Some(mut runtime) = self.runtime.lock().await.take() else {
            return;
        };

        let _ = runtime.shutdown.send(true);
        let grace = self.config.shutdown_timeout();

        for listener in runtime.listeners.values_mut() {
            listener.stop(grace).await;
        }
        for mut task in runtime.tasks {
            if timeout(grace, &mut task).await.is_err() {
                task.abort();
            }
        }
        log::info!("Sync engine stopped");
    }

    async fn run_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.full_sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown) => return,
            }
            tokio::select! {
                _ = self.sync_all() => {}
                _ = shutdown_requested(&mut shutdown) => return,
            }
        }
    }

    async fn dispatch_changes(
        self: Arc<Self>,
        mut batches: mpsc::UnboundedReceiver<ChangeBatch>,
        shutdown: watch::Receiver<bool>,
    ) {
        let mut stop = shutdown.clone();
        loop {
            let batch = tokio::select! {
                batch = batches.recv() => match batch {
                    Some(batch) => batch,
                    None => return,
                },
                _ = shutdown_requested(&mut stop) => return,
            };

            let engine = Arc::clone(&self);
            let mut task_stop = shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = engine.on_change(batch) => {}
                    _ = shutdown_requested(&mut task_stop) => {}
                }
            });
        }
    }

    async fn watch_connectivity(
        self: Arc<Self>,
        signal: ConnectivitySignal,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut signal = Some(signal);
        loop {
            tokio::select! {
                restored = online_transition(&mut signal) => {
                    if !restored {
                        return;
                    }
                    log::info!("Connectivity restored; starting full sync");
                }
                _ = shutdown_requested(&mut shutdown) => return,
            }
            tokio::select! {
                _ = self.sync_all() => {}
                _ = shutdown_requested(&mut shutdown) => return,
            }
        }
    }

    /// Incremental pull for a listener batch. At most one pull waits behind a
    /// running pass; further triggers are folded into it.
    async fn on_change(&self, batch: ChangeBatch) {
        let Ok(slot) = self.slot(&batch.collection) else {
            return;
        };
        if slot.pull_queued.swap(true, Ordering::AcqRel) {
            log::debug!(
                "Pull for '{}' already queued; folding {} change(s)",
                batch.collection,
                batch.events.len()
            );
            return;
        }

        // Cleared once the pass lock is ours, or if we are cancelled while
        // waiting for it.
        let queued = QueuedPull(&slot.pull_queued);
        let _pass = slot.pass.lock().await;
        drop(queued);

        let _syncing = PassGuard::begin(&self.status);
        let mut report = CollectionReport::new(&batch.collection, PassKind::Incremental);
        if let Err(e) = self.pull(&batch.collection, slot, &mut report).await {
            report.fail(e.to_string());
        }
        if let Some(error) = &report.error {
            log::warn!("Incremental sync of '{}' failed: {error}", batch.collection);
            self.status.record_error(error.clone());
        }
    }

    /// Full pass over every collection. Errors are reported per collection
    /// and in the status, never propagated.
    pub async fn sync_all(&self) -> Vec<CollectionReport> {
        let _syncing = PassGuard::begin(&self.status);
        log::info!("Full sync started");

        let reports = join_all(
            self.config
                .collections
                .iter()
                .map(|collection| self.sync_collection(collection)),
        )
        .await;

        let reports: Vec<CollectionReport> = reports
            .into_iter()
            .zip(&self.config.collections)
            .map(|(res, collection)| {
                res.unwrap_or_else(|e| {
                    let mut report = CollectionReport::new(collection, PassKind::Full);
                    report.fail(e.to_string());
                    report
                })
            })
            .collect();

        let error = reports.iter().find_map(|r| r.error.clone());
        if error.is_none() {
            self.notifier.reset();
        }
        self.status.complete_full_pass(now_ms(), error);

        if let Some(outbox) = &self.outbox {
            match outbox.pending_count().await {
                Ok(pending) => self.status.set_pending_outbox(pending),
                Err(e) => log::warn!("Could not read outbox backlog: {e}"),
            }
        }

        for r in &reports {
            log::info!(
                "Full sync of '{}': pushed={}, push_failed={}, pulled={}, kept_local={}",
                r.collection,
                r.pushed,
                r.push_failed,
                r.pulled,
                r.kept_local
            );
        }
        reports
    }

    /// Push then pull one collection.
    pub async fn sync_collection(&self, collection: &str) -> Result<CollectionReport, SyncError> {
        let slot = self.slot(collection)?;
        let _pass = slot.pass.lock().await;
        let _syncing = PassGuard::begin(&self.status);

        let mut report = CollectionReport::new(collection, PassKind::Full);
        self.push(collection, slot, &mut report).await?;
        if let Err(e) = self.pull(collection, slot, &mut report).await {
            report.fail(e.to_string());
        }
        if let Some(error) = &report.error {
            self.status.record_error(error.clone());
        }
        Ok(report)
    }

    /// Pull-only pass for one collection.
    pub async fn pull_collection(&self, collection: &str) -> Result<CollectionReport, SyncError> {
        let slot = self.slot(collection)?;
        let _pass = slot.pass.lock().await;
        let _syncing = PassGuard::begin(&self.status);

        let mut report = CollectionReport::new(collection, PassKind::Incremental);
        self.pull(collection, slot, &mut report).await?;
        Ok(report)
    }

    async fn push(
        &self,
        collection: &str,
        slot: &CollectionSlot,
        report: &mut CollectionReport,
    ) -> Result<(), SyncError> {
        for record in self.local.list_dirty(collection).await? {
            let remote = &self.remote;
            let pushed = &record;
            let label = format!("push {collection}/{}", record.id);
            let result = self
                .retry
                .execute(&label, || async move { remote.put(collection, pushed).await })
                .await;

            match result {
                Ok(()) => {
                    let _write = slot.write.lock().await;
                    // Only clear the flag if nobody edited the record meanwhile.
                    if let Some(current) = self.local.get(collection, &record.id).await? {
                        if current.is_dirty && current.last_modified_ms == record.last_modified_ms {
                            self.local.upsert(collection, current.clean()).await?;
                        }
                    }
                    report.pushed += 1;
                }
                Err(e) => {
                    report.push_failed += 1;
                    report.fail(e.to_string());
                }
            }
        }
        Ok(())
    }

    async fn pull(
        &self,
        collection: &str,
        slot: &CollectionSlot,
        report: &mut CollectionReport,
    ) -> Result<(), SyncError> {
        let remote = &self.remote;
        let records = self
            .retry
            .execute(&format!("fetch {collection}"), || async move {
                remote.fetch(collection).await
            })
            .await
            .map_err(|e| SyncError::RetryExhausted(e.to_string()))?;

        for incoming in records {
            self.clock.observe(incoming.last_modified_ms);

            let _write = slot.write.lock().await;
            let local = self.local.get(collection, &incoming.id).await?;
            match resolve(local.as_ref(), &incoming) {
                Resolution::TakeRemote => {
                    self.local.upsert(collection, incoming.clean()).await?;
                    report.pulled += 1;
                }
                Resolution::KeepLocal => report.kept_local += 1,
                Resolution::Ignore => {}
            }
        }
        Ok(())
    }

    /// Write `data` locally as a dirty record stamped with a fresh timestamp.
    pub async fn save(&self, collection: &str, id: &str, data: Value) -> Result<SyncRecord, SyncError> {
        let slot = self.slot(collection)?;
        let _write = slot.write.lock().await;
        let record = SyncRecord::local(id, data, self.clock.now());
        self.local.upsert(collection, record.clone()).await?;
        Ok(record)
    }

    pub async fn save_entity<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        entity: &T,
    ) -> Result<SyncRecord, SyncError> {
        self.save(collection, id, serde_json::to_value(entity)?).await
    }

    /// Tombstone a record. Returns `None` when there is nothing to delete.
    pub async fn remove(&self, collection: &str, id: &str) -> Result<Option<SyncRecord>, SyncError> {
        let slot = self.slot(collection)?;
        let _write = slot.write.lock().await;
        let Some(existing) = self.local.get(collection, id).await? else {
            return Ok(None);
        };
        let tombstone = existing.tombstone(self.clock.now());
        self.local.upsert(collection, tombstone.clone()).await?;
        Ok(Some(tombstone))
    }

    /// Physically drop tombstones that already reached the remote.
    pub async fn compact(&self, collection: &str) -> Result<usize, SyncError> {
        let slot = self.slot(collection)?;
        let _write = slot.write.lock().await;
        let mut removed = 0;
        for record in self.local.list(collection).await? {
            if record.is_deleted && !record.is_dirty {
                self.local.delete(collection, &record.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
