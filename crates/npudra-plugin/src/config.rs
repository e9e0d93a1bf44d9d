//! Opaque `NpuConfig` parameters attached to claims and device classes.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::claim::{ConfigSource, DeviceAllocationConfiguration};
use crate::error::{PluginError, PluginResult};

pub const API_VERSION: &str = "npu.resource.example.com/v1alpha1";
pub const NPU_CONFIG_KIND: &str = "NpuConfig";

const MAX_TEMPLATE_NAME_LEN: usize = 63;

static TEMPLATE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("template name pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharingStrategy {
    TimeSlicing,
    SpacePartitioning,
}

impl fmt::Display for SharingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharingStrategy::TimeSlicing => write!(f, "TimeSlicing"),
            SharingStrategy::SpacePartitioning => write!(f, "SpacePartitioning"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSliceInterval {
    #[default]
    Default,
    Short,
    Medium,
    Long,
}

impl fmt::Display for TimeSliceInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeSliceInterval::Default => "Default",
            TimeSliceInterval::Short => "Short",
            TimeSliceInterval::Medium => "Medium",
            TimeSliceInterval::Long => "Long",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeSlicingConfig {
    #[serde(default)]
    pub interval: TimeSliceInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SpacePartitioningConfig {
    pub partition_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NpuSharing {
    pub strategy: SharingStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_slicing_config: Option<TimeSlicingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_partitioning_config: Option<SpacePartitioningConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VnpuSpec {
    #[serde(default)]
    pub template_name: String,
}

/// Driver configuration carried in opaque claim and class parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NpuConfig {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<NpuSharing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnpu_spec: Option<VnpuSpec>,
}

impl NpuConfig {
    /// Config applied to every request no other config matches: exclusive
    /// access, no vNPU template.
    pub fn default_config() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: NPU_CONFIG_KIND.to_string(),
            sharing: None,
            vnpu_spec: None,
        }
    }

    /// Config selecting a vNPU template.
    pub fn with_template(template_name: &str) -> Self {
        Self {
            vnpu_spec: Some(VnpuSpec {
                template_name: template_name.to_string(),
            }),
            ..Self::default_config()
        }
    }

    /// Non-empty vNPU template name, if any.
    pub fn template_name(&self) -> Option<&str> {
        self.vnpu_spec
            .as_ref()
            .map(|spec| spec.template_name.as_str())
            .filter(|name| !name.is_empty())
    }

    /// Fill in defaults inside an existing sharing block.
    pub fn normalize(&mut self) {
        let Some(sharing) = self.sharing.as_mut() else {
            return;
        };
        match sharing.strategy {
            SharingStrategy::TimeSlicing => {
                sharing
                    .time_slicing_config
                    .get_or_insert(TimeSlicingConfig {
                        interval: TimeSliceInterval::Default,
                    });
            }
            SharingStrategy::SpacePartitioning => {
                sharing
                    .space_partitioning_config
                    .get_or_insert(SpacePartitioningConfig { partition_count: 1 });
            }
        }
    }

    pub fn validate(&self) -> PluginResult<()> {
        if self.api_version != API_VERSION || self.kind != NPU_CONFIG_KIND {
            return Err(PluginError::InvalidConfig(format!(
                "unsupported config type {}/{}",
                self.api_version, self.kind
            )));
        }
        if let Some(sharing) = &self.sharing {
            validate_sharing(sharing)?;
        }
        if let Some(spec) = &self.vnpu_spec
            && !spec.template_name.is_empty()
        {
            let name = &spec.template_name;
            if name.len() > MAX_TEMPLATE_NAME_LEN || !TEMPLATE_NAME_RE.is_match(name) {
                return Err(PluginError::InvalidConfig(format!(
                    "invalid vNPU template name {name:?}"
                )));
            }
        }
        Ok(())
    }

    /// Sharing env vars for one device, keyed by its env suffix.
    pub fn sharing_env(&self, suffix: &str) -> Vec<String> {
        let Some(sharing) = &self.sharing else {
            return Vec::new();
        };
        let mut env = vec![format!(
            "NPU_DEVICE_{suffix}_SHARING_STRATEGY={}",
            sharing.strategy
        )];
        match sharing.strategy {
            SharingStrategy::TimeSlicing => {
                if let Some(ts) = &sharing.time_slicing_config {
                    env.push(format!("NPU_DEVICE_{suffix}_TIMESLICE_INTERVAL={}", ts.interval));
                }
            }
            SharingStrategy::SpacePartitioning => {
                if let Some(sp) = &sharing.space_partitioning_config {
                    env.push(format!(
                        "NPU_DEVICE_{suffix}_PARTITION_COUNT={}",
                        sp.partition_count
                    ));
                }
            }
        }
        env
    }
}

fn validate_sharing(sharing: &NpuSharing) -> PluginResult<()> {
    match sharing.strategy {
        SharingStrategy::TimeSlicing => {
            if sharing.space_partitioning_config.is_some() {
                return Err(PluginError::InvalidConfig(
                    "spacePartitioningConfig is not allowed with TimeSlicing".to_string(),
                ));
            }
            if sharing.time_slicing_config.is_none() {
                return Err(PluginError::InvalidConfig(
                    "TimeSlicing requires timeSlicingConfig".to_string(),
                ));
            }
        }
        SharingStrategy::SpacePartitioning => {
            if sharing.time_slicing_config.is_some() {
                return Err(PluginError::InvalidConfig(
                    "timeSlicingConfig is not allowed with SpacePartitioning".to_string(),
                ));
            }
            match &sharing.space_partitioning_config {
                None => {
                    return Err(PluginError::InvalidConfig(
                        "SpacePartitioning requires spacePartitioningConfig".to_string(),
                    ));
                }
                Some(sp) if sp.partition_count < 1 => {
                    return Err(PluginError::InvalidConfig(format!(
                        "partitionCount must be at least 1, got {}",
                        sp.partition_count
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Strictly decode opaque parameters into an [`NpuConfig`].
pub fn decode_npu_config(parameters: &serde_json::Value) -> PluginResult<NpuConfig> {
    let config: NpuConfig = serde_json::from_value(parameters.clone()).map_err(|e| {
        PluginError::InvalidConfig(format!("error decoding config parameters: {e}"))
    })?;
    if config.api_version != API_VERSION || config.kind != NPU_CONFIG_KIND {
        return Err(PluginError::InvalidConfig(format!(
            "unsupported config type {}/{}",
            config.api_version, config.kind
        )));
    }
    Ok(config)
}

/// A decoded config and the requests it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueDeviceConfig {
    /// Empty applies to every request.
    pub requests: Vec<String>,
    pub config: NpuConfig,
}

impl OpaqueDeviceConfig {
    pub fn applies_to(&self, request: &str) -> bool {
        self.requests.is_empty() || self.requests.iter().any(|r| r == request)
    }
}

/// Decode the configs attached to an allocation, class configs first and
/// claim configs after, so later entries take precedence on a reverse scan.
pub fn resolve_opaque_configs(
    driver_name: &str,
    configs: &[DeviceAllocationConfiguration],
) -> PluginResult<Vec<OpaqueDeviceConfig>> {
    let mut resolved = Vec::new();
    for source in [ConfigSource::FromClass, ConfigSource::FromClaim] {
        for config in configs.iter().filter(|c| c.source == source) {
            let Some(opaque) = &config.opaque else {
                return Err(PluginError::InvalidConfig(
                    "only opaque parameters are supported by this driver".to_string(),
                ));
            };
            if opaque.driver != driver_name {
                continue;
            }
            resolved.push(OpaqueDeviceConfig {
                requests: config.requests.clone(),
                config: decode_npu_config(&opaque.parameters)?,
            });
        }
    }
    Ok(resolved)
}
