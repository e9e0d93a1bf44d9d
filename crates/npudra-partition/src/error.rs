//! Partition manager error types.

use thiserror::Error;

/// Errors that can occur while allocating or releasing slices.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("no partition template satisfies aicore>={ai_core}, memory>={memory_gb}GB")]
    NoMatchingTemplate { ai_core: u32, memory_gb: u32 },

    #[error("no available slice {0}")]
    SliceNotFound(String),
}

pub type PartitionResult<T> = Result<T, PartitionError>;
