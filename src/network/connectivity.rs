use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use super::RemoteStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Connected,
    Disconnected,
    Reconnecting,
}

impl ConnectivityState {
    pub fn is_online(self) -> bool {
        matches!(self, ConnectivityState::Connected)
    }
}

/// Read side of an online/offline event source.
#[derive(Debug, Clone)]
pub struct ConnectivitySignal {
    rx: watch::Receiver<bool>,
    last: bool,
}

/// Write side for hosts that learn connectivity from the platform rather
/// than from probing.
#[derive(Debug)]
pub struct ConnectivityHandle {
    tx: watch::Sender<bool>,
}

impl ConnectivityHandle {
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn signal(&self) -> ConnectivitySignal {
        ConnectivitySignal::from_receiver(self.tx.subscribe())
    }
}

impl ConnectivitySignal {
    pub fn manual(initially_online: bool) -> (ConnectivityHandle, ConnectivitySignal) {
        let (tx, rx) = watch::channel(initially_online);
        (ConnectivityHandle { tx }, ConnectivitySignal::from_receiver(rx))
    }

    fn from_receiver(rx: watch::Receiver<bool>) -> Self {
        let last = *rx.borrow();
        Self { rx, last }
    }

    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait for the next offline -> online transition. Returns false once the
    /// source is gone.
    pub async fn online_transition(&mut self) -> bool {
        loop {
            if self.rx.changed().await.is_err() {
                return false;
            }
            let now = *self.rx.borrow_and_update();
            let restored = now && !self.last;
            self.last = now;
            if restored {
                return true;
            }
        }
    }
}

/// Periodically probes the remote and publishes the result.
pub struct ConnectivityMonitor {
    remote: Arc<dyn RemoteStore>,
    interval: Duration,
    state: watch::Sender<ConnectivityState>,
    online: ConnectivityHandle,
}

impl ConnectivityMonitor {
    pub fn new(remote: Arc<dyn RemoteStore>, interval: Duration) -> Self {
        let (state, _) = watch::channel(ConnectivityState::Disconnected);
        let (online, _) = ConnectivitySignal::manual(false);
        Self {
            remote,
            interval,
            state,
            online,
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    pub fn signal(&self) -> ConnectivitySignal {
        self.online.signal()
    }

    pub async fn check_once(&self) -> bool {
        self.remote.probe().await
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut reconnecting = false;

        loop {
            let ok = self.check_once().await;

            let new_state = if ok {
                reconnecting = false;
                ConnectivityState::Connected
            } else if reconnecting {
                ConnectivityState::Reconnecting
            } else {
                reconnecting = true;
                ConnectivityState::Disconnected
            };

            self.online.set_online(new_state.is_online());
            self.state.send_if_modified(|current| {
                if *current == new_state {
                    return false;
                }
                log::info!("Connectivity changed: {:?} -> {:?}", current, new_state);
                *current = new_state;
                true
            });

            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
