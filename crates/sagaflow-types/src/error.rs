use thiserror::Error;
use uuid::Uuid;

/// Errors raised by snapshot stores.
#[derive(Debug, Error)]
pub enum SnapshotStoreError {
    #[error("snapshot not found: {0}")]
    NotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}
