use thiserror::Error;

use crate::network::NetworkError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Network error: {0}")]
    NetworkError(#[from] NetworkError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Collection is not synchronized: {0}")]
    UnknownCollection(String),

    #[error("{0}")]
    RetryExhausted(String),
}
