//! npudra.toml driver configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::{DRIVER_NAME, NODE_NAME_ENV};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub driver_name: String,
    /// Node identity; falls back to `$NODE_NAME` when unset.
    pub node_name: Option<String>,
    /// Directory holding the checkpoint database.
    pub plugin_dir: PathBuf,
    /// Directory CDI spec files are written to.
    pub cdi_root: PathBuf,
    /// Directory DeviceClass manifests are published to. Defaults to
    /// `deviceclasses` inside the plugin dir.
    pub device_class_dir: Option<PathBuf>,
    pub enable_partitioning: bool,
    /// Static hardware table standing in for the device management library.
    pub devices: Vec<DeviceConfig>,
    /// Replaces the built-in template catalog when present.
    pub templates: Option<Vec<TemplateConfig>>,
    pub families: Option<Vec<FamilyConfig>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub logic_id: u32,
    pub phy_id: u32,
    pub model: String,
    /// Reported AI-core count. Unset simulates a failed hardware query.
    pub aicore: Option<u32>,
    /// Reported memory in GB. Unset simulates a failed hardware query.
    pub memory_gb: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateConfig {
    pub name: String,
    pub aicore: u32,
    pub memory_gb: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FamilyConfig {
    /// Substring matched against the device model name.
    pub model_match: String,
    pub templates: Vec<String>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DRIVER_NAME.to_string(),
            node_name: None,
            plugin_dir: PathBuf::from(format!("/var/lib/kubelet/plugins/{DRIVER_NAME}")),
            cdi_root: PathBuf::from("/var/run/cdi"),
            device_class_dir: None,
            enable_partitioning: true,
            devices: Vec::new(),
            templates: None,
            families: None,
        }
    }
}

impl DriverConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DriverConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Node name from the config, then `$NODE_NAME`, else empty.
    pub fn resolved_node_name(&self) -> String {
        self.node_name
            .clone()
            .or_else(|| std::env::var(NODE_NAME_ENV).ok())
            .unwrap_or_default()
    }

    /// Path of the redb checkpoint database inside the plugin dir.
    pub fn checkpoint_db_path(&self) -> PathBuf {
        self.plugin_dir.join("checkpoint.redb")
    }

    /// Where DeviceClass manifests go: the configured dir, else one inside
    /// the plugin dir.
    pub fn device_class_path(&self) -> PathBuf {
        self.device_class_dir
            .clone()
            .unwrap_or_else(|| self.plugin_dir.join("deviceclasses"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.driver_name, "npu.example.com");
        assert!(config.enable_partitioning);
        assert!(config.devices.is_empty());
        assert_eq!(
            config.checkpoint_db_path(),
            PathBuf::from("/var/lib/kubelet/plugins/npu.example.com/checkpoint.redb")
        );
        assert_eq!(
            config.device_class_path(),
            PathBuf::from("/var/lib/kubelet/plugins/npu.example.com/deviceclasses")
        );
    }

    #[test]
    fn test_device_class_dir_override() {
        let config: DriverConfig = toml::from_str("device_class_dir = \"/srv/classes\"").unwrap();
        assert_eq!(config.device_class_path(), PathBuf::from("/srv/classes"));
    }

    #[test]
    fn test_parse_devices_and_catalog() {
        let toml_str = r#"
node_name = "worker-1"
cdi_root = "/tmp/cdi"
enable_partitioning = false

[[devices]]
logic_id = 0
phy_id = 4
model = "Ascend910B"
aicore = 24
memory_gb = 64

[[devices]]
logic_id = 1
phy_id = 5
model = "Ascend910B"

[[templates]]
name = "half"
aicore = 12
memory_gb = 32

[[families]]
model_match = "Ascend910"
templates = ["half"]
"#;
        let config: DriverConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.resolved_node_name(), "worker-1");
        assert_eq!(config.cdi_root, PathBuf::from("/tmp/cdi"));
        assert!(!config.enable_partitioning);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].aicore, Some(24));
        assert_eq!(config.devices[1].memory_gb, None);
        assert_eq!(config.templates.as_ref().unwrap()[0].name, "half");
        assert_eq!(config.families.as_ref().unwrap()[0].templates, vec!["half"]);
        // Unset fields keep their defaults.
        assert_eq!(config.driver_name, "npu.example.com");
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = DriverConfig::default();
        config.node_name = Some("n1".to_string());
        let toml_str = config.to_toml_string().unwrap();
        assert!(toml_str.contains("n1"));
        let parsed: DriverConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.node_name.as_deref(), Some("n1"));
    }
}
