//! Predefined device classes for full cards and vNPU templates.
//!
//! Each model on the node gets a full-card class; each template a model
//! supports gets a memory class and an AI-core class whose opaque config
//! selects that template. Classes are upserted: created when missing,
//! updated only when their spec changed.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use npudra_partition::{PartitionManager, PartitionTemplate};

use crate::claim::OpaqueDeviceConfiguration;
use crate::config::NpuConfig;
use crate::error::{PluginError, PluginResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClass {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    pub spec: DeviceClassSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceClassSpec {
    pub selectors: Vec<DeviceSelector>,
    pub config: Vec<DeviceClassConfiguration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSelector {
    pub cel: CelDeviceSelector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CelDeviceSelector {
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceClassConfiguration {
    pub opaque: OpaqueDeviceConfiguration,
}

/// Minimal device-class API.
pub trait DeviceClassClient: Send + Sync {
    fn get(&self, name: &str) -> PluginResult<Option<DeviceClass>>;

    fn create(&self, class: &DeviceClass) -> PluginResult<()>;

    /// Replace an existing class. `class.resource_version` must match the
    /// stored one.
    fn update(&self, class: &DeviceClass) -> PluginResult<()>;
}

/// Stores device classes as `<name>.json` files in a directory.
#[derive(Debug, Clone)]
pub struct FileDeviceClassClient {
    dir: PathBuf,
}

impl FileDeviceClassClient {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn write(&self, class: &DeviceClass) -> PluginResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| PluginError::DeviceClass(format!("failed to create {}: {e}", self.dir.display())))?;
        let bytes = serde_json::to_vec_pretty(class)
            .map_err(|e| PluginError::DeviceClass(format!("failed to encode {}: {e}", class.name)))?;
        fs::write(self.path(&class.name), bytes)
            .map_err(|e| PluginError::DeviceClass(format!("failed to write {}: {e}", class.name)))
    }
}

fn next_version(current: Option<&str>) -> String {
    let n: u64 = current.and_then(|v| v.parse().ok()).unwrap_or(0);
    (n + 1).to_string()
}

impl DeviceClassClient for FileDeviceClassClient {
    fn get(&self, name: &str) -> PluginResult<Option<DeviceClass>> {
        match fs::read(self.path(name)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PluginError::DeviceClass(format!("failed to parse {name}: {e}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PluginError::DeviceClass(format!("failed to read {name}: {e}"))),
        }
    }

    fn create(&self, class: &DeviceClass) -> PluginResult<()> {
        if self.path(&class.name).exists() {
            return Err(PluginError::DeviceClass(format!(
                "device class {} already exists",
                class.name
            )));
        }
        let mut stored = class.clone();
        stored.resource_version = Some(next_version(None));
        self.write(&stored)
    }

    fn update(&self, class: &DeviceClass) -> PluginResult<()> {
        let current = self.get(&class.name)?.ok_or_else(|| {
            PluginError::DeviceClass(format!("device class {} not found", class.name))
        })?;
        if current.resource_version != class.resource_version {
            return Err(PluginError::DeviceClass(format!(
                "conflict updating {}: resource version changed",
                class.name
            )));
        }
        let mut stored = class.clone();
        stored.resource_version = Some(next_version(current.resource_version.as_deref()));
        self.write(&stored)
    }
}

/// Lowercase the model and replace spaces and slashes with dashes.
pub fn safe_model_name(model: &str) -> String {
    model.replace([' ', '/'], "-").to_lowercase()
}

pub fn build_device_class(
    name: &str,
    expression: &str,
    config: &NpuConfig,
    driver_name: &str,
) -> PluginResult<DeviceClass> {
    let parameters = serde_json::to_value(config)
        .map_err(|e| PluginError::DeviceClass(format!("failed to encode config for {name}: {e}")))?;
    Ok(DeviceClass {
        name: name.to_string(),
        resource_version: None,
        spec: DeviceClassSpec {
            selectors: vec![DeviceSelector {
                cel: CelDeviceSelector {
                    expression: expression.to_string(),
                },
            }],
            config: vec![DeviceClassConfiguration {
                opaque: OpaqueDeviceConfiguration {
                    driver: driver_name.to_string(),
                    parameters,
                },
            }],
        },
    })
}

pub fn full_card_class(driver_name: &str, model: &str) -> PluginResult<DeviceClass> {
    let name = format!("npu-{}.example.com", safe_model_name(model));
    let expression = format!(
        r#"device.attributes["{driver_name}"].model == "{model}" && device.attributes["{driver_name}"].type == "NPU""#
    );
    build_device_class(&name, &expression, &NpuConfig::default_config(), driver_name)
}

pub fn memory_class(
    driver_name: &str,
    model: &str,
    template: &PartitionTemplate,
) -> PluginResult<DeviceClass> {
    let name = format!("npu-{}-mem{}.example.com", safe_model_name(model), template.memory_gb);
    let expression = format!(
        r#"device.attributes["{driver_name}"].memory >= {} && device.attributes["{driver_name}"].model == "{model}""#,
        template.memory_gb
    );
    build_device_class(
        &name,
        &expression,
        &NpuConfig::with_template(&template.name),
        driver_name,
    )
}

pub fn aicore_class(
    driver_name: &str,
    model: &str,
    template: &PartitionTemplate,
) -> PluginResult<DeviceClass> {
    let name = format!("npu-{}-aicore{}.example.com", safe_model_name(model), template.ai_core);
    let expression = format!(
        r#"device.attributes["{driver_name}"].aicore >= {} && device.attributes["{driver_name}"].model == "{model}""#,
        template.ai_core
    );
    build_device_class(
        &name,
        &expression,
        &NpuConfig::with_template(&template.name),
        driver_name,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Create `want` if missing, update it if its spec differs.
pub fn upsert_device_class(
    client: &dyn DeviceClassClient,
    want: &DeviceClass,
) -> PluginResult<UpsertOutcome> {
    let Some(got) = client.get(&want.name)? else {
        client.create(want)?;
        info!(class = %want.name, "device class created");
        return Ok(UpsertOutcome::Created);
    };
    if spec_equal(&got.spec, &want.spec) {
        debug!(class = %want.name, "device class unchanged");
        return Ok(UpsertOutcome::Unchanged);
    }
    let mut update = want.clone();
    update.resource_version = got.resource_version;
    client.update(&update)?;
    info!(class = %want.name, "device class updated");
    Ok(UpsertOutcome::Updated)
}

/// Structural comparison, so config parameters compare as JSON values.
fn spec_equal(a: &DeviceClassSpec, b: &DeviceClassSpec) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    /// Class name and error message.
    pub failed: Vec<(String, String)>,
}

/// The classes the node's models and templates call for, by name.
pub fn desired_device_classes(
    manager: &PartitionManager,
    driver_name: &str,
) -> (BTreeMap<String, DeviceClass>, Vec<(String, String)>) {
    let mut classes = BTreeMap::new();
    let mut failed = Vec::new();
    for (model, templates) in manager.model_templates() {
        let mut built = vec![full_card_class(driver_name, &model)];
        for template in templates.values() {
            built.push(memory_class(driver_name, &model, template));
            built.push(aicore_class(driver_name, &model, template));
        }
        for class in built {
            match class {
                // Templates sharing a quantity map to one class; first wins.
                Ok(class) => {
                    classes.entry(class.name.clone()).or_insert(class);
                }
                Err(e) => failed.push((model.clone(), e.to_string())),
            }
        }
    }
    (classes, failed)
}

/// Upsert every desired class. Failures are logged and reported, never fatal.
pub fn sync_device_classes(
    manager: &PartitionManager,
    driver_name: &str,
    client: &dyn DeviceClassClient,
) -> SyncReport {
    let (classes, failed) = desired_device_classes(manager, driver_name);
    let mut report = SyncReport {
        failed,
        ..SyncReport::default()
    };
    for (name, class) in classes {
        match upsert_device_class(client, &class) {
            Ok(UpsertOutcome::Created) => report.created.push(name),
            Ok(UpsertOutcome::Updated) => report.updated.push(name),
            Ok(UpsertOutcome::Unchanged) => report.unchanged.push(name),
            Err(e) => {
                warn!(class = %name, error = %e, "failed to upsert device class");
                report.failed.push((name, e.to_string()));
            }
        }
    }
    info!(
        created = report.created.len(),
        updated = report.updated.len(),
        unchanged = report.unchanged.len(),
        failed = report.failed.len(),
        "device class sync completed"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use npudra_core::DRIVER_NAME;
    use npudra_partition::TemplateCatalog;

    fn manager() -> PartitionManager {
        let manager = PartitionManager::new(TemplateCatalog::builtin());
        manager.init_physical_device(0, 0, "Ascend910B");
        manager.init_physical_device(1, 1, "Ascend910B");
        manager.init_physical_device(2, 2, "Ascend310P3");
        manager
    }

    #[test]
    fn safe_model_names() {
        assert_eq!(safe_model_name("Ascend910B"), "ascend910b");
        assert_eq!(safe_model_name("Ascend 310P/3"), "ascend-310p-3");
    }

    #[test]
    fn class_shapes() {
        let full = full_card_class(DRIVER_NAME, "Ascend910B").unwrap();
        assert_eq!(full.name, "npu-ascend910b.example.com");
        assert_eq!(
            full.spec.selectors[0].cel.expression,
            r#"device.attributes["npu.example.com"].model == "Ascend910B" && device.attributes["npu.example.com"].type == "NPU""#
        );
        assert!(full.spec.config[0].opaque.parameters.get("vnpuSpec").is_none());

        let template = PartitionTemplate::new("vir04", 4, 8);
        let mem = memory_class(DRIVER_NAME, "Ascend910B", &template).unwrap();
        assert_eq!(mem.name, "npu-ascend910b-mem8.example.com");
        assert!(mem.spec.selectors[0].cel.expression.contains(".memory >= 8"));
        assert_eq!(
            mem.spec.config[0].opaque.parameters["vnpuSpec"]["templateName"],
            "vir04"
        );
        let aicore = aicore_class(DRIVER_NAME, "Ascend910B", &template).unwrap();
        assert_eq!(aicore.name, "npu-ascend910b-aicore4.example.com");
        assert_eq!(aicore.spec.config[0].opaque.driver, DRIVER_NAME);
    }

    #[test]
    fn desired_classes_follow_each_model_templates() {
        let (classes, failed) = desired_device_classes(&manager(), DRIVER_NAME);
        assert!(failed.is_empty());
        // 910: 1 full + 4 mem + 4 aicore; 310P: 1 full + 3 mem + 3 aicore.
        assert_eq!(classes.len(), 16);
        assert!(classes.contains_key("npu-ascend310p3-mem12.example.com"));
        assert!(!classes.contains_key("npu-ascend310p3-mem16.example.com"));
    }

    #[test]
    fn sync_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let client = FileDeviceClassClient::new(dir.path());
        let manager = manager();

        let first = sync_device_classes(&manager, DRIVER_NAME, &client);
        assert_eq!(first.created.len(), 16);
        assert!(first.failed.is_empty());

        let second = sync_device_classes(&manager, DRIVER_NAME, &client);
        assert!(second.created.is_empty());
        assert!(second.updated.is_empty());
        assert_eq!(second.unchanged.len(), 16);
    }

    #[test]
    fn upsert_updates_changed_spec_with_stored_version() {
        let dir = tempfile::tempdir().unwrap();
        let client = FileDeviceClassClient::new(dir.path());
        let template = PartitionTemplate::new("vir04", 4, 4);
        let class = memory_class(DRIVER_NAME, "Ascend910B", &template).unwrap();
        assert_eq!(upsert_device_class(&client, &class).unwrap(), UpsertOutcome::Created);

        let mut changed = class.clone();
        changed.spec.selectors[0].cel.expression = "true".to_string();
        assert_eq!(upsert_device_class(&client, &changed).unwrap(), UpsertOutcome::Updated);

        let stored = client.get(&class.name).unwrap().unwrap();
        assert_eq!(stored.resource_version.as_deref(), Some("2"));
        assert_eq!(stored.spec.selectors[0].cel.expression, "true");
    }

    #[test]
    fn stale_update_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let client = FileDeviceClassClient::new(dir.path());
        let class = full_card_class(DRIVER_NAME, "Ascend910B").unwrap();
        client.create(&class).unwrap();
        assert!(client.create(&class).is_err());

        let err = client.update(&class).unwrap_err();
        assert!(matches!(err, PluginError::DeviceClass(_)));
    }
}
