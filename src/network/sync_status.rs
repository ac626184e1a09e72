use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;

pub const STATUS_UP_TO_DATE: &str = "Up to date";
pub const STATUS_SYNCING: &str = "Syncing…";
pub const STATUS_FAILED: &str = "Sync failed";

/// Process-wide sync state as seen by observers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// True while at least one reconciliation pass is running.
    pub is_syncing: bool,
    /// Completion time of the last full pass, in milliseconds since UNIX_EPOCH.
    pub last_sync_at_ms: Option<u64>,
    /// Last sync error message, if any (None if the last full pass was clean).
    pub last_error: Option<String>,
    /// Undelivered outbox items at the last refresh.
    pub pending_outbox: usize,
}

impl SyncStatus {
    pub fn summary(&self) -> &'static str {
        if self.is_syncing {
            STATUS_SYNCING
        } else if self.last_error.is_some() {
            STATUS_FAILED
        } else {
            STATUS_UP_TO_DATE
        }
    }
}

/// Owning side of [`SyncStatus`]. Only the engine mutates it; everyone else
/// gets a `watch::Receiver`.
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<SyncStatus>,
    active_passes: AtomicUsize,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self {
            tx,
            active_passes: AtomicUsize::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn begin_pass(&self) {
        self.active_passes.fetch_add(1, Ordering::SeqCst);
        self.tx.send_modify(|s| s.is_syncing = true);
    }

    pub(crate) fn end_pass(&self) {
        let remaining = self.active_passes.fetch_sub(1, Ordering::SeqCst) - 1;
        self.tx.send_modify(|s| s.is_syncing = remaining > 0);
    }

    pub(crate) fn record_error(&self, message: String) {
        self.tx.send_modify(|s| s.last_error = Some(message));
    }

    pub(crate) fn complete_full_pass(&self, at_ms: u64, error: Option<String>) {
        self.tx.send_modify(|s| {
            s.last_sync_at_ms = Some(at_ms);
            s.last_error = error;
        });
    }

    pub(crate) fn set_pending_outbox(&self, pending: usize) {
        self.tx.send_if_modified(|s| {
            let changed = s.pending_outbox != pending;
            s.pending_outbox = pending;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_prefers_syncing_over_failure() {
        let mut status = SyncStatus::default();
        assert_eq!(status.summary(), STATUS_UP_TO_DATE);

        status.last_error = Some("boom".to_string());
        assert_eq!(status.summary(), STATUS_FAILED);

        status.is_syncing = true;
        assert_eq!(status.summary(), STATUS_SYNCING);
    }

    #[test]
    fn overlapping_passes_keep_syncing_flag() {
        let publisher = StatusPublisher::new();
        publisher.begin_pass();
        publisher.begin_pass();
        publisher.end_pass();
        assert!(publisher.snapshot().is_syncing);

        publisher.end_pass();
        assert!(!publisher.snapshot().is_syncing);
    }

    #[test]
    fn clean_full_pass_clears_error() {
        let publisher = StatusPublisher::new();
        let observer = publisher.subscribe();

        publisher.record_error("sync failed after 3 attempts: timeout".to_string());
        assert_eq!(observer.borrow().summary(), STATUS_FAILED);

        publisher.complete_full_pass(1_000, None);
        let status = observer.borrow().clone();
        assert_eq!(status.last_sync_at_ms, Some(1_000));
        assert_eq!(status.summary(), STATUS_UP_TO_DATE);
    }
}
