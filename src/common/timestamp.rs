use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uhlc::{HLCBuilder, Timestamp, HLC, NTP64};

/// How far ahead of the local wall clock a remote stamp may be and still be
/// merged into the clock.
pub const MAX_REMOTE_DRIFT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Milliseconds since UNIX_EPOCH according to the system clock.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn to_ms(ts: &Timestamp) -> u64 {
    ts.get_time().to_duration().as_millis() as u64
}

/// Local write clock backed by a hybrid logical clock.
///
/// Stamps are whole milliseconds (`last_modified_ms`) and strictly increase
/// per `Clock`, even when the system clock stalls or steps backwards.
pub struct Clock {
    hlc: HLC,
    // Serializes stamp issue so two writers never share a millisecond.
    issue: Mutex<()>,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            hlc: HLCBuilder::new().with_max_delta(MAX_REMOTE_DRIFT).build(),
            issue: Mutex::new(()),
        }
    }

    /// Generate a new local timestamp for an outgoing write.
    pub fn now(&self) -> u64 {
        let _issue = self.issue.lock().unwrap_or_else(|e| e.into_inner());
        let ms = to_ms(&self.hlc.new_timestamp());
        // Push the clock to the next millisecond so the following stamp
        // cannot truncate to the same value.
        self.advance_past(ms);
        ms
    }

    /// Merge a timestamp observed on a remote record so later local writes
    /// sort strictly after it.
    pub fn observe(&self, remote_ms: u64) {
        let _issue = self.issue.lock().unwrap_or_else(|e| e.into_inner());
        self.advance_past(remote_ms);
    }

    fn advance_past(&self, ms: u64) {
        // A microsecond past the boundary so the NTP64 fraction cannot round
        // back into `ms`.
        let next = Duration::from_millis(ms.saturating_add(1)) + Duration::from_micros(1);
        let ts = Timestamp::new(NTP64::from(next), *self.hlc.get_id());
        if let Err(e) = self.hlc.update_with_timestamp(&ts) {
            log::warn!("Ignoring timestamp {ms} for the local clock: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_stamps_strictly_increase() {
        let clock = Clock::new();
        let stamps: Vec<u64> = (0..1_000).map(|_| clock.now()).collect();
        assert!(stamps.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn stamps_follow_wall_clock() {
        let clock = Clock::new();
        let before = now_ms();
        let stamp = clock.now();
        assert!(stamp >= before);
        assert!(stamp < before + 60_000);
    }

    #[test]
    fn observed_remote_stamp_is_overtaken() {
        let clock = Clock::new();
        let ahead = now_ms() + 3_600_000;

        clock.observe(ahead);
        assert!(clock.now() > ahead);
    }

    #[test]
    fn stamp_beyond_allowed_drift_is_not_merged() {
        let clock = Clock::new();
        let too_far = now_ms() + MAX_REMOTE_DRIFT.as_millis() as u64 * 2;

        clock.observe(too_far);
        assert!(clock.now() < too_far);
    }
}
