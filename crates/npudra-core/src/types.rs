//! Shared constants and device naming used across npudra crates.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Name the driver registers under; also the attribute domain.
pub const DRIVER_NAME: &str = "npu.example.com";

/// Key of the single checkpoint holding all prepared claims.
pub const CHECKPOINT_KEY: &str = "checkpoint.json";

/// Environment variable consulted when the config does not name the node.
pub const NODE_NAME_ENV: &str = "NODE_NAME";

/// Container env var listing the visible NPU logical indices.
pub const VISIBLE_DEVICES_ENV: &str = "ASCEND_VISIBLE_DEVICES";

/// Container env var carrying the vNPU template of a partitioned slice.
pub const VNPU_SPECS_ENV: &str = "ASCEND_VNPU_SPECS";

static DEVICE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^npu-(\d+)-(\d+)$").expect("device name pattern is valid"));

/// Parsed `npu-<logical>-<slice>` device name.
///
/// Slice index 0 is the id the full card is published under; remainder
/// slices created by subdivision count up from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceName {
    pub logical_index: u32,
    pub slice_index: u32,
}

impl DeviceName {
    pub fn full_card(logical_index: u32) -> Self {
        Self {
            logical_index,
            slice_index: 0,
        }
    }

    pub fn slice(logical_index: u32, slice_index: u32) -> Self {
        Self {
            logical_index,
            slice_index,
        }
    }

    /// Parse a device name. Returns `None` for anything not shaped like
    /// `npu-<logical>-<slice>`.
    pub fn parse(name: &str) -> Option<Self> {
        let caps = DEVICE_NAME_RE.captures(name)?;
        let logical_index = caps[1].parse().ok()?;
        let slice_index = caps[2].parse().ok()?;
        Some(Self {
            logical_index,
            slice_index,
        })
    }

    /// Env-var safe suffix, e.g. `0_3` for `npu-0-3`.
    pub fn env_suffix(&self) -> String {
        format!("{}_{}", self.logical_index, self.slice_index)
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "npu-{}-{}", self.logical_index, self.slice_index)
    }
}

/// Fully qualified device attribute name, e.g. `npu.example.com/model`.
pub fn qualified_attribute(driver_name: &str, attribute: &str) -> String {
    format!("{driver_name}/{attribute}")
}
