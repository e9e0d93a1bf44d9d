//! CDI spec files consumed by the container runtime.
//!
//! The driver keeps one common spec (node-level env) plus one transient
//! spec per prepared claim. A claim spec holds a single device named after
//! the claim UID whose edits are the merged edits of every device prepared
//! for that claim.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use npudra_checkpoint::{ContainerEdits, PreparedDevice};

use crate::error::{PluginError, PluginResult};

pub const CDI_CLASS: &str = "npu";
pub const CDI_COMMON_DEVICE_NAME: &str = "common";
pub const CDI_VERSION: &str = "0.5.0";

/// Writes and removes CDI specs on behalf of the device-state controller.
pub trait CdiHandler: Send + Sync {
    fn create_common_spec_file(&self) -> PluginResult<()>;

    fn create_claim_spec_file(&self, claim_uid: &str, devices: &[PreparedDevice]) -> PluginResult<()>;

    /// Removing a spec that does not exist succeeds.
    fn delete_claim_spec_file(&self, claim_uid: &str) -> PluginResult<()>;

    /// Qualified CDI device ids a container of the claim is given.
    fn claim_devices(&self, claim_uid: &str) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiSpec {
    pub cdi_version: String,
    pub kind: String,
    pub devices: Vec<CdiDevice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdiDevice {
    pub name: String,
    pub container_edits: ContainerEdits,
}

/// Writes JSON CDI specs into a spec directory.
#[derive(Debug, Clone)]
pub struct CdiSpecWriter {
    root: PathBuf,
    vendor: String,
    driver_name: String,
    node_name: String,
}

impl CdiSpecWriter {
    pub fn new(root: impl Into<PathBuf>, driver_name: &str, node_name: &str) -> Self {
        Self {
            root: root.into(),
            vendor: format!("k8s.{driver_name}"),
            driver_name: driver_name.to_string(),
            node_name: node_name.to_string(),
        }
    }

    /// `<vendor>/<class>`.
    pub fn kind(&self) -> String {
        format!("{}/{CDI_CLASS}", self.vendor)
    }

    pub fn qualified_name(&self, device: &str) -> String {
        format!("{}={device}", self.kind())
    }

    /// Path of the transient spec named `id`.
    pub fn spec_path(&self, id: &str) -> PathBuf {
        self.root
            .join(format!("{}-{CDI_CLASS}_{id}.json", self.vendor))
    }

    /// Read back a spec, `None` if absent.
    pub fn read_spec(&self, id: &str) -> PluginResult<Option<CdiSpec>> {
        match fs::read(self.spec_path(id)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PluginError::Cdi(format!("failed to parse spec {id}: {e}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PluginError::Cdi(format!("failed to read spec {id}: {e}"))),
        }
    }

    fn spec(&self, device: &str, container_edits: ContainerEdits) -> CdiSpec {
        CdiSpec {
            cdi_version: CDI_VERSION.to_string(),
            kind: self.kind(),
            devices: vec![CdiDevice {
                name: device.to_string(),
                container_edits,
            }],
        }
    }

    /// Write through a temp file and rename so readers never see a partial spec.
    fn write_spec(&self, id: &str, spec: &CdiSpec) -> PluginResult<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            PluginError::Cdi(format!("failed to create {}: {e}", self.root.display()))
        })?;
        let path = self.spec_path(id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(spec)
            .map_err(|e| PluginError::Cdi(format!("failed to encode spec {id}: {e}")))?;
        fs::write(&tmp, bytes)
            .map_err(|e| PluginError::Cdi(format!("failed to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| PluginError::Cdi(format!("failed to install {}: {e}", path.display())))?;
        debug!(path = %path.display(), "CDI spec written");
        Ok(())
    }
}

impl CdiHandler for CdiSpecWriter {
    fn create_common_spec_file(&self) -> PluginResult<()> {
        let edits = ContainerEdits::from_env(vec![
            format!("KUBERNETES_NODE_NAME={}", self.node_name),
            format!("DRA_RESOURCE_DRIVER_NAME={}", self.driver_name),
        ]);
        self.write_spec(
            CDI_COMMON_DEVICE_NAME,
            &self.spec(CDI_COMMON_DEVICE_NAME, edits),
        )
    }

    fn create_claim_spec_file(&self, claim_uid: &str, devices: &[PreparedDevice]) -> PluginResult<()> {
        let mut merged = ContainerEdits::default();
        for device in devices {
            merged.append(&device.container_edits);
        }
        self.write_spec(claim_uid, &self.spec(claim_uid, merged))
    }

    fn delete_claim_spec_file(&self, claim_uid: &str) -> PluginResult<()> {
        let path = self.spec_path(claim_uid);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "CDI spec removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PluginError::Cdi(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }

    fn claim_devices(&self, claim_uid: &str) -> Vec<String> {
        vec![
            self.qualified_name(CDI_COMMON_DEVICE_NAME),
            self.qualified_name(claim_uid),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use npudra_core::DRIVER_NAME;

    fn prepared(device: &str, env: &str) -> PreparedDevice {
        PreparedDevice {
            request_name: "npu".to_string(),
            pool_name: "node-a".to_string(),
            device_name: device.to_string(),
            cdi_device_ids: Vec::new(),
            container_edits: ContainerEdits::from_env(vec![env.to_string()]),
            slice: None,
        }
    }

    #[test]
    fn names_follow_vendor_and_class() {
        let writer = CdiSpecWriter::new("/var/run/cdi", DRIVER_NAME, "node-a");
        assert_eq!(writer.kind(), "k8s.npu.example.com/npu");
        assert_eq!(
            writer.spec_path("uid-1"),
            PathBuf::from("/var/run/cdi/k8s.npu.example.com-npu_uid-1.json")
        );
        assert_eq!(
            writer.claim_devices("uid-1"),
            vec!["k8s.npu.example.com/npu=common", "k8s.npu.example.com/npu=uid-1"]
        );
    }

    #[test]
    fn common_spec_carries_node_env() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CdiSpecWriter::new(dir.path(), DRIVER_NAME, "node-a");
        writer.create_common_spec_file().unwrap();

        let spec = writer.read_spec(CDI_COMMON_DEVICE_NAME).unwrap().unwrap();
        assert_eq!(spec.devices[0].name, "common");
        assert_eq!(
            spec.devices[0].container_edits.env,
            vec!["KUBERNETES_NODE_NAME=node-a", "DRA_RESOURCE_DRIVER_NAME=npu.example.com"]
        );
    }

    #[test]
    fn claim_spec_merges_edits_and_deletes_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CdiSpecWriter::new(dir.path().join("cdi"), DRIVER_NAME, "node-a");
        let devices = vec![
            prepared("npu-0-0", "ASCEND_VISIBLE_DEVICES=0"),
            prepared("npu-1-0", "ASCEND_VISIBLE_DEVICES=1"),
        ];
        writer.create_claim_spec_file("uid-1", &devices).unwrap();

        let spec = writer.read_spec("uid-1").unwrap().unwrap();
        assert_eq!(spec.kind, "k8s.npu.example.com/npu");
        assert_eq!(spec.devices.len(), 1);
        assert_eq!(spec.devices[0].name, "uid-1");
        assert_eq!(
            spec.devices[0].container_edits.env,
            vec!["ASCEND_VISIBLE_DEVICES=0", "ASCEND_VISIBLE_DEVICES=1"]
        );
        assert!(!writer.spec_path("uid-1").with_extension("json.tmp").exists());

        writer.delete_claim_spec_file("uid-1").unwrap();
        assert!(writer.read_spec("uid-1").unwrap().is_none());
        writer.delete_claim_spec_file("uid-1").unwrap();
    }
}
