use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Runtime knobs of the sync core. Everything is passed in at construction;
/// nothing is read from the environment by the library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Collections kept in sync (one realtime listener each).
    pub collections: Vec<String>,
    pub remote_url: String,
    pub auth_token: Option<String>,
    pub data_dir: String,
    pub full_sync_interval_ms: u64,
    pub push_max_attempts: u32,
    pub push_base_delay_ms: u64,
    pub outbox_flush_interval_ms: u64,
    pub outbox_max_attempts: u32,
    pub outbox_base_delay_ms: u64,
    /// Stop retrying an outbox item after this many attempts. `None` retries
    /// forever.
    pub outbox_dead_letter_after: Option<u32>,
    pub listener_reconnect_delay_ms: u64,
    pub listener_max_reconnect_delay_ms: u64,
    pub connectivity_probe_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            collections: vec![],
            remote_url: "http://127.0.0.1:9000".to_string(),
            auth_token: None,
            data_dir: "./data".to_string(),
            full_sync_interval_ms: 60_000,
            push_max_attempts: 3,
            push_base_delay_ms: 1_000,
            outbox_flush_interval_ms: 180_000,
            outbox_max_attempts: 2,
            outbox_base_delay_ms: 500,
            outbox_dead_letter_after: None,
            listener_reconnect_delay_ms: 2_000,
            listener_max_reconnect_delay_ms: 5_000,
            connectivity_probe_interval_ms: 10_000,
            shutdown_timeout_ms: 2_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    /// Load a JSON config file; missing fields take their defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_millis(self.full_sync_interval_ms)
    }

    pub fn push_base_delay(&self) -> Duration {
        Duration::from_millis(self.push_base_delay_ms)
    }

    pub fn outbox_flush_interval(&self) -> Duration {
        Duration::from_millis(self.outbox_flush_interval_ms)
    }

    pub fn outbox_base_delay(&self) -> Duration {
        Duration::from_millis(self.outbox_base_delay_ms)
    }

    /// Fixed listener reconnect delay, clamped to the configured ceiling.
    pub fn listener_reconnect_delay(&self) -> Duration {
        Duration::from_millis(
            self.listener_reconnect_delay_ms
                .min(self.listener_max_reconnect_delay_ms),
        )
    }

    pub fn connectivity_probe_interval(&self) -> Duration {
        Duration::from_millis(self.connectivity_probe_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_default_values_are_sensible() {
        let cfg = SyncConfig::default();
        assert!(cfg.collections.is_empty());
        assert_eq!(cfg.push_max_attempts, 3);
        assert_eq!(cfg.outbox_dead_letter_after, None);
        assert_eq!(cfg.listener_reconnect_delay(), Duration::from_secs(2));
    }

    #[test]
    fn reconnect_delay_is_capped() {
        let cfg = SyncConfig {
            listener_reconnect_delay_ms: 30_000,
            listener_max_reconnect_delay_ms: 5_000,
            ..SyncConfig::default()
        };
        assert_eq!(cfg.listener_reconnect_delay(), Duration::from_secs(5));
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"collections": ["companies", "users"], "push_max_attempts": 5}}"#
        )
        .unwrap();

        let cfg = SyncConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.collections, vec!["companies", "users"]);
        assert_eq!(cfg.push_max_attempts, 5);
        assert_eq!(cfg.full_sync_interval_ms, 60_000);
    }

    #[test]
    fn bad_config_file_reports_config_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"collections\": 42}}").unwrap();
        assert!(matches!(
            SyncConfig::from_file(file.path()),
            Err(ConfigError::ParseError(_))
        ));

        let missing = file.path().with_extension("missing");
        assert!(matches!(
            SyncConfig::from_file(missing),
            Err(ConfigError::IoError(_))
        ));
    }
}
