//! Device-state controller error types.

use thiserror::Error;

use npudra_checkpoint::CheckpointError;
use npudra_partition::PartitionError;

/// Errors surfaced by claim preparation and the driver collaborators.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("requested NPU is not allocatable: {0}")]
    NotAllocatable(String),

    #[error("invalid NPU config: {0}")]
    InvalidConfig(String),

    #[error("invalid claim: {0}")]
    InvalidClaim(String),

    #[error("claim {0} is not allocated yet")]
    ClaimNotAllocated(String),

    #[error("checkpoint error: {0}")]
    Persistence(#[from] CheckpointError),

    #[error("CDI error: {0}")]
    Cdi(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("device class error: {0}")]
    DeviceClass(String),
}

pub type PluginResult<T> = Result<T, PluginError>;

/// A slice that could not be released while unpreparing a claim.
///
/// Not fatal: the claim is still removed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to release slice {device_name}: {source}")]
pub struct ReleaseWarning {
    pub device_name: String,
    pub source: PartitionError,
}
