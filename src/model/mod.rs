//! Shapes shared by every synchronizable collection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One synchronizable record of a collection.
///
/// `last_modified_ms` is the only conflict-resolution signal: whichever side
/// wrote last stamps it. `is_dirty` marks unpushed local changes and is only
/// cleared after the remote confirmed the write. Deletions are tombstones
/// (`is_deleted`) until compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub id: String,
    pub last_modified_ms: u64,
    #[serde(default)]
    pub is_dirty: bool,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub data: Value,
}

impl SyncRecord {
    /// A locally written record, pending push.
    pub fn local<S: Into<String>>(id: S, data: Value, last_modified_ms: u64) -> Self {
        Self {
            id: id.into(),
            last_modified_ms,
            is_dirty: true,
            is_deleted: false,
            data,
        }
    }

    /// A record as it exists on the remote side (never dirty).
    pub fn remote<S: Into<String>>(id: S, data: Value, last_modified_ms: u64) -> Self {
        Self {
            id: id.into(),
            last_modified_ms,
            is_dirty: false,
            is_deleted: false,
            data,
        }
    }

    pub fn from_entity<T: Serialize>(
        id: impl Into<String>,
        entity: &T,
        last_modified_ms: u64,
    ) -> serde_json::Result<Self> {
        Ok(Self::local(id, serde_json::to_value(entity)?, last_modified_ms))
    }

    pub fn entity<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.data)
    }

    /// Tombstone for this record, stamped with `last_modified_ms`.
    pub fn tombstone(&self, last_modified_ms: u64) -> Self {
        Self {
            id: self.id.clone(),
            last_modified_ms,
            is_dirty: true,
            is_deleted: true,
            data: Value::Null,
        }
    }

    pub fn clean(mut self) -> Self {
        self.is_dirty = false;
        self
    }
}

/// A side effect that must eventually reach the remote side.
///
/// Items are never dropped on failure: they stay queued until delivered or
/// purged by an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: u64,
    /// Delivery channel on the remote side (e.g. `notifications`, `audit`).
    pub topic: String,
    pub payload: Vec<u8>,
    pub created_at_ms: u64,
    pub attempts: u32,
    pub is_sent: bool,
    pub sent_at_ms: Option<u64>,
}

impl OutboxItem {
    pub fn new(id: u64, topic: impl Into<String>, payload: Vec<u8>, created_at_ms: u64) -> Self {
        Self {
            id,
            topic: topic.into(),
            payload,
            created_at_ms,
            attempts: 0,
            is_sent: false,
            sent_at_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Full replacement of the value at `path`.
    Put,
    /// Partial update of the children of `path`.
    Patch,
}

/// A change notification received from the remote side.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: String,
    pub kind: ChangeKind,
    pub path: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Company {
        name: String,
        employees: u32,
    }

    #[test]
    fn entity_roundtrip_through_record() {
        let company = Company {
            name: "Acme".to_string(),
            employees: 12,
        };
        let record = SyncRecord::from_entity("c1", &company, 10).unwrap();
        assert!(record.is_dirty);
        assert!(!record.is_deleted);
        assert_eq!(record.entity::<Company>().unwrap(), company);
    }

    #[test]
    fn tombstone_is_dirty_and_drops_body() {
        let record = SyncRecord::remote("c1", json!({"name": "Acme"}), 5);
        let tomb = record.tombstone(6);
        assert!(tomb.is_deleted);
        assert!(tomb.is_dirty);
        assert_eq!(tomb.last_modified_ms, 6);
        assert_eq!(tomb.data, Value::Null);
    }

    #[test]
    fn missing_flags_default_to_false() {
        let record: SyncRecord =
            serde_json::from_str(r#"{"id":"c1","last_modified_ms":3}"#).unwrap();
        assert!(!record.is_dirty);
        assert!(!record.is_deleted);
        assert_eq!(record.data, Value::Null);
    }
}
