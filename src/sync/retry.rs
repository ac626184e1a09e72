//! Bounded retry with linearly growing backoff.
//!
//! Every error is treated as retryable; the attempt budget is the only stop
//! condition. The wait before retry `n` is `base_delay * n`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use super::notify::NotificationSink;

/// Terminal failure of a retried operation.
#[derive(Debug, Error)]
#[error("sync failed after {attempts} attempts: {last}")]
pub struct RetryError<E> {
    pub attempts: u32,
    #[source]
    pub last: E,
}

#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    sink: Option<Arc<dyn NotificationSink>>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; zero is treated as one.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            sink: None,
        }
    }

    /// Notify `sink` whenever the attempt budget runs out.
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    pub async fn execute<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("{label}: succeeded on attempt {attempt}");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= self.max_attempts => {
                    let err = RetryError { attempts: attempt, last: e };
                    log::error!("{label}: {err}");
                    if let Some(sink) = &self.sink {
                        sink.notify(&err.to_string());
                    }
                    return Err(err);
                }
                Err(e) => {
                    let delay = self.delay_for_attempt(attempt);
                    log::warn!(
                        "{label}: attempt {attempt}/{} failed: {e}; retrying in {:?}",
                        self.max_attempts,
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::notify::ChannelSink;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    #[test]
    fn delay_grows_with_attempt_number() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        let result = policy
            .execute("op", || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(format!("failure {n}"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        // 1s after the first failure, 2s after the second.
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts_and_notifies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let policy =
            RetryPolicy::new(2, Duration::from_millis(10)).with_sink(Arc::new(ChannelSink::new(tx)));

        let err = policy
            .execute("push", || async { Err::<(), _>("connection reset") })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 2);
        assert_eq!(err.to_string(), "sync failed after 2 attempts: connection reset");
        assert_eq!(rx.try_recv().unwrap(), err.to_string());
    }

    #[tokio::test]
    async fn exhausted_error_exposes_last_failure_as_source() {
        use std::error::Error as _;

        let policy = RetryPolicy::new(1, Duration::ZERO);
        let err = policy
            .execute("fetch", || async {
                Err::<(), _>(std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts, 1);
        assert_eq!(err.source().unwrap().to_string(), "timed out");
    }
}
