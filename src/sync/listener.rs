//! Long-lived change subscription for one collection.
//!
//! `Idle -> Connecting -> Streaming -> (Reconnecting | Stopped)`. Lost
//! connections are retried forever after a fixed delay; only `stop` ends the
//! task.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::shutdown_requested;
use crate::model::ChangeEvent;
use crate::network::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Changes received together for one collection.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub collection: String,
    pub events: Vec<ChangeEvent>,
}

pub struct RealtimeListener {
    collection: String,
    remote: Arc<dyn RemoteStore>,
    handler: mpsc::UnboundedSender<ChangeBatch>,
    reconnect_delay: Duration,
    state: Arc<watch::Sender<ListenerState>>,
    task: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl RealtimeListener {
    pub fn new(
        collection: impl Into<String>,
        remote: Arc<dyn RemoteStore>,
        handler: mpsc::UnboundedSender<ChangeBatch>,
        reconnect_delay: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            collection: collection.into(),
            remote,
            handler,
            reconnect_delay,
            state: Arc::new(state),
            task: None,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    pub fn is_active(&self) -> bool {
        matches!(&self.task, Some((_, handle)) if !handle.is_finished())
    }

    /// Spawn the subscription task. No-op while already active.
    pub fn start(&mut self) {
        if self.is_active() {
            log::debug!("Listener for '{}' already active", self.collection);
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_listener(
            self.collection.clone(),
            Arc::clone(&self.remote),
            self.handler.clone(),
            self.reconnect_delay,
            Arc::clone(&self.state),
            stop_rx,
        ));
        self.task = Some((stop_tx, handle));
    }

    /// Cancel the subscription, waiting at most `grace` for the task to wind
    /// down before aborting it.
    pub async fn stop(&mut self, grace: Duration) {
        let Some((stop_tx, mut handle)) = self.task.take() else {
            return;
        };
        let _ = stop_tx.send(true);
        if timeout(grace, &mut handle).await.is_err() {
            log::warn!(
                "Listener for '{}' did not stop within {:?}; aborting",
                self.collection,
                grace
            );
            handle.abort();
        }
        self.state.send_replace(ListenerState::Stopped);
    }
}

async fn run_listener(
    collection: String,
    remote: Arc<dyn RemoteStore>,
    handler: mpsc::UnboundedSender<ChangeBatch>,
    reconnect_delay: Duration,
    state: Arc<watch::Sender<ListenerState>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        state.send_replace(ListenerState::Connecting);

        let subscribed = tokio::select! {
            res = remote.subscribe(&collection) => res,
            _ = shutdown_requested(&mut stop) => break,
        };

        match subscribed {
            Ok(mut subscription) => {
                state.send_replace(ListenerState::Streaming);
                log::info!("Listener for '{collection}' streaming");

                loop {
                    tokio::select! {
                        event = subscription.next() => match event {
                            Some(first) => {
                                let mut events = vec![first];
                                while let Some(more) = subscription.try_next() {
                                    events.push(more);
                                }
                                log::debug!("Listener for '{collection}' received {} change(s)", events.len());
                                let batch = ChangeBatch { collection: collection.clone(), events };
                                if handler.send(batch).is_err() {
                                    log::debug!("Change handler for '{collection}' is gone; stopping listener");
                                    state.send_replace(ListenerState::Stopped);
                                    return;
                                }
                            }
                            None => {
                                log::warn!("Listener for '{collection}' lost its stream");
                                break;
                            }
                        },
                        _ = shutdown_requested(&mut stop) => {
                            subscription.cancel();
                            state.send_replace(ListenerState::Stopped);
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                log::warn!("Listener for '{collection}' failed to subscribe: {e}");
            }
        }

        state.send_replace(ListenerState::Reconnecting);
        log::info!("Listener for '{collection}' reconnecting in {:?}", reconnect_delay);

        tokio::select! {
            _ = sleep(reconnect_delay) => {}
            _ = shutdown_requested(&mut stop) => break,
        }
    }

    state.send_replace(ListenerState::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncRecord;
    use crate::network::MemoryRemoteStore;
    use serde_json::json;

    async fn wait_for(rx: &mut watch::Receiver<ListenerState>, target: ListenerState) {
        timeout(Duration::from_secs(5), async {
            while *rx.borrow_and_update() != target {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap_or_else(|_| panic!("listener never reached {target:?}"));
    }

    #[tokio::test]
    async fn forwards_remote_changes_as_batches() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener =
            RealtimeListener::new("companies", remote.clone(), tx, Duration::from_millis(20));
        let mut state = listener.watch_state();

        assert_eq!(listener.state(), ListenerState::Idle);
        listener.start();
        wait_for(&mut state, ListenerState::Streaming).await;

        remote
            .insert("companies", SyncRecord::remote("c1", json!({"name": "A"}), 1))
            .await;
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.collection, "companies");
        assert_eq!(batch.events[0].path, "/c1");

        listener.stop(Duration::from_secs(1)).await;
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert!(!listener.is_active());
    }

    #[tokio::test]
    async fn reconnects_after_stream_loss_without_restart() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut listener =
            RealtimeListener::new("companies", remote.clone(), tx, Duration::from_millis(20));
        let mut state = listener.watch_state();

        listener.start();
        wait_for(&mut state, ListenerState::Streaming).await;

        remote.disconnect("companies").await;
        wait_for(&mut state, ListenerState::Reconnecting).await;
        wait_for(&mut state, ListenerState::Streaming).await;

        assert_eq!(remote.subscribe_calls("companies").await, 2);
        listener.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn keeps_retrying_while_remote_is_down() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_online(false).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut listener =
            RealtimeListener::new("companies", remote.clone(), tx, Duration::from_millis(5));
        let mut state = listener.watch_state();

        listener.start();
        sleep(Duration::from_millis(60)).await;
        assert!(remote.subscribe_calls("companies").await >= 2);

        remote.set_online(true).await;
        wait_for(&mut state, ListenerState::Streaming).await;
        listener.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn second_start_is_a_no_op() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut listener =
            RealtimeListener::new("companies", remote.clone(), tx, Duration::from_millis(20));
        let mut state = listener.watch_state();

        listener.start();
        listener.start();
        wait_for(&mut state, ListenerState::Streaming).await;
        sleep(Duration::from_millis(30)).await;

        assert_eq!(remote.subscribe_calls("companies").await, 1);
        listener.stop(Duration::from_secs(1)).await;
    }
}
