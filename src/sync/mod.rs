//! Reconciliation core: retry policy, realtime listeners, outbox and the
//! engine tying them together.

mod error;
pub mod engine;
pub mod listener;
pub mod notify;
pub mod outbox;
pub mod retry;

use tokio::sync::watch;

pub use engine::{resolve, CollectionReport, PassKind, Resolution, SyncEngine};
pub use error::SyncError;
pub use listener::{ChangeBatch, ListenerState, RealtimeListener};
pub use notify::{ChannelSink, LatchedSink, LogSink, NotificationSink};
pub use outbox::{FlushReport, Outbox};
pub use retry::{RetryError, RetryPolicy};

/// Resolves once `true` is published on the shutdown channel or its sender
/// goes away.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}
