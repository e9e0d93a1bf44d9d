//! Error types for the checkpoint store.

use thiserror::Error;

/// Result type alias for checkpoint store operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Errors that can occur during checkpoint store operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("checkpoint not found: {0}")]
    NotFound(String),

    #[error("checkpoint {key} is corrupt: checksum mismatch")]
    Corrupt { key: String },
}
