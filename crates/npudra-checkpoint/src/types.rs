//! Checkpoint payload types.
//!
//! These types describe what has been handed out per claim: the prepared
//! devices, their CDI ids and the container edits injected for them. They
//! serialize to the CDI JSON field names so the same values can be written
//! into spec files unchanged.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CheckpointError, CheckpointResult};

/// Claim UID → devices prepared for that claim.
pub type PreparedClaims = BTreeMap<String, Vec<PreparedDevice>>;

// ── Container edits ────────────────────────────────────────────────

/// Edits applied to a container that is granted a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerEdits {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_nodes: Vec<DeviceNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mounts: Vec<Mount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<Hook>,
}

impl ContainerEdits {
    pub fn from_env(env: Vec<String>) -> Self {
        Self {
            env,
            ..Self::default()
        }
    }

    /// Append every edit of `other`.
    pub fn append(&mut self, other: &ContainerEdits) {
        self.env.extend(other.env.iter().cloned());
        self.device_nodes.extend(other.device_nodes.iter().cloned());
        self.mounts.extend(other.mounts.iter().cloned());
        self.hooks.extend(other.hooks.iter().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
            && self.device_nodes.is_empty()
            && self.mounts.is_empty()
            && self.hooks.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNode {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    pub hook_name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
}

// ── Prepared devices ───────────────────────────────────────────────

/// Marks a prepared device as backed by a slice of the partition manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceGrant {
    /// Template the slice was carved with; `None` for whole-card use.
    pub template_name: Option<String>,
}

/// One device handed out for one request of a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDevice {
    pub request_name: String,
    pub pool_name: String,
    pub device_name: String,
    #[serde(rename = "cdiDeviceIDs")]
    pub cdi_device_ids: Vec<String>,
    pub container_edits: ContainerEdits,
    /// Present when the device came out of the partition manager and must
    /// be released there on unprepare.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice: Option<SliceGrant>,
}

// ── Checkpoint ─────────────────────────────────────────────────────

/// Version 1 checkpoint payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointV1 {
    #[serde(default)]
    pub prepared_claims: PreparedClaims,
    /// Logical index → next slice index per card. Slice ids below the
    /// counter have been published and must not be handed out again.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub slice_counters: BTreeMap<u32, u32>,
}

/// The versioned checkpoint. Only `v1` exists today.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub v1: CheckpointV1,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    checksum: String,
    v1: &'a CheckpointV1,
}

#[derive(Deserialize)]
struct Envelope {
    checksum: String,
    v1: CheckpointV1,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepared_claims(&self) -> &PreparedClaims {
        &self.v1.prepared_claims
    }

    pub fn prepared_claims_mut(&mut self) -> &mut PreparedClaims {
        &mut self.v1.prepared_claims
    }

    pub fn slice_counters(&self) -> &BTreeMap<u32, u32> {
        &self.v1.slice_counters
    }

    pub fn set_slice_counters(&mut self, counters: BTreeMap<u32, u32>) {
        self.v1.slice_counters = counters;
    }

    /// Serialize with a fresh checksum.
    pub fn marshal(&self) -> CheckpointResult<Vec<u8>> {
        let envelope = EnvelopeRef {
            checksum: checksum(&self.v1)?,
            v1: &self.v1,
        };
        serde_json::to_vec(&envelope).map_err(|e| CheckpointError::Serialize(e.to_string()))
    }

    /// Deserialize and verify the checksum.
    pub fn unmarshal(key: &str, bytes: &[u8]) -> CheckpointResult<Self> {
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(|e| CheckpointError::Deserialize(e.to_string()))?;
        if checksum(&envelope.v1)? != envelope.checksum {
            return Err(CheckpointError::Corrupt {
                key: key.to_string(),
            });
        }
        Ok(Self { v1: envelope.v1 })
    }
}

/// Hex SHA-256 of the payload's JSON encoding. Claims are kept in a
/// `BTreeMap` so the encoding is stable.
fn checksum(v1: &CheckpointV1) -> CheckpointResult<String> {
    let bytes = serde_json::to_vec(v1).map_err(|e| CheckpointError::Serialize(e.to_string()))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
