//! User-facing failure notifications, kept behind a trait so the sync core
//! never depends on a presentation layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, message: &str) {
        log::warn!("{message}");
    }
}

/// Forwards notifications to a channel owned by an observer.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, message: &str) {
        // A closed observer is not our failure.
        let _ = self.tx.send(message.to_string());
    }
}

/// Lets one notification through per failure streak.
pub struct LatchedSink {
    inner: Arc<dyn NotificationSink>,
    fired: AtomicBool,
}

impl LatchedSink {
    pub fn new(inner: Arc<dyn NotificationSink>) -> Self {
        Self {
            inner,
            fired: AtomicBool::new(false),
        }
    }

    /// Re-arm after a clean pass.
    pub fn reset(&self) {
        self.fired.store(false, Ordering::SeqCst);
    }
}

impl NotificationSink for LatchedSink {
    fn notify(&self, message: &str) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.inner.notify(message);
        }
    }
}
