//! Resource claims as handed to the driver by the orchestrator.
//!
//! Only the parts of a claim the driver reads are modelled: its identity
//! and the scheduler's allocation result (devices plus attached configs).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaim {
    pub uid: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
    /// Set once the scheduler has bound the claim to devices.
    #[serde(default)]
    pub allocation: Option<AllocationResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    #[serde(default)]
    pub results: Vec<DeviceRequestAllocationResult>,
    #[serde(default)]
    pub config: Vec<DeviceAllocationConfiguration>,
}

/// One device picked for one request of the claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequestAllocationResult {
    pub request: String,
    /// Driver owning the device; empty is taken to mean this driver.
    #[serde(default)]
    pub driver: String,
    pub pool: String,
    pub device: String,
}

/// Where an attached config came from. Class configs act as defaults that
/// claim configs can override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    FromClass,
    FromClaim,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAllocationConfiguration {
    pub source: ConfigSource,
    /// Requests this config applies to; empty means all of them.
    #[serde(default)]
    pub requests: Vec<String>,
    #[serde(default)]
    pub opaque: Option<OpaqueDeviceConfiguration>,
}

/// Driver-specific parameters, decoded by the driver they name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpaqueDeviceConfiguration {
    pub driver: String,
    pub parameters: serde_json::Value,
}
