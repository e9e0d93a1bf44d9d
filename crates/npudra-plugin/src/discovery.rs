//! NPU discovery: builds the initial inventory and partition manager.

use std::sync::Arc;

use tracing::{info, warn};

use npudra_core::DeviceName;
use npudra_core::config::DeviceConfig;
use npudra_partition::{PartitionManager, TemplateCatalog};

use crate::error::{PluginError, PluginResult};
use crate::inventory::Inventory;

/// One card as reported by the device manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpuDevice {
    pub logic_id: u32,
    pub phy_id: u32,
    pub model: String,
}

/// Source of hardware facts about the node's cards.
pub trait DeviceManager: Send + Sync {
    fn devices(&self) -> PluginResult<Vec<NpuDevice>>;

    fn chip_ai_core_count(&self, logic_id: u32) -> PluginResult<u32>;

    /// Card memory in GB.
    fn chip_memory(&self, logic_id: u32) -> PluginResult<u32>;
}

/// Device manager backed by the `[[devices]]` table of the driver config.
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceManager {
    devices: Vec<DeviceConfig>,
}

impl StaticDeviceManager {
    pub fn new(devices: Vec<DeviceConfig>) -> Self {
        Self { devices }
    }

    fn device(&self, logic_id: u32) -> PluginResult<&DeviceConfig> {
        self.devices
            .iter()
            .find(|d| d.logic_id == logic_id)
            .ok_or_else(|| PluginError::Discovery(format!("no NPU with logic id {logic_id}")))
    }
}

impl DeviceManager for StaticDeviceManager {
    fn devices(&self) -> PluginResult<Vec<NpuDevice>> {
        Ok(self
            .devices
            .iter()
            .map(|d| NpuDevice {
                logic_id: d.logic_id,
                phy_id: d.phy_id,
                model: d.model.clone(),
            })
            .collect())
    }

    fn chip_ai_core_count(&self, logic_id: u32) -> PluginResult<u32> {
        self.device(logic_id)?
            .aicore
            .ok_or_else(|| PluginError::Discovery(format!("AI core count unknown for NPU {logic_id}")))
    }

    fn chip_memory(&self, logic_id: u32) -> PluginResult<u32> {
        self.device(logic_id)?
            .memory_gb
            .ok_or_else(|| PluginError::Discovery(format!("memory size unknown for NPU {logic_id}")))
    }
}

/// Per-model stand-in when the device manager cannot report a quantity.
pub fn fallback_resource(model: &str) -> u32 {
    if model.contains("Ascend910") {
        32
    } else if model.contains("Ascend310P") {
        16
    } else {
        0
    }
}

fn fetch_ai_core(manager: &dyn DeviceManager, device: &NpuDevice) -> u32 {
    manager
        .chip_ai_core_count(device.logic_id)
        .unwrap_or_else(|e| {
            warn!(npu = device.logic_id, error = %e, "failed to fetch AI core count");
            fallback_resource(&device.model)
        })
}

fn fetch_memory(manager: &dyn DeviceManager, device: &NpuDevice) -> u32 {
    manager.chip_memory(device.logic_id).unwrap_or_else(|e| {
        warn!(npu = device.logic_id, error = %e, "failed to fetch memory size");
        fallback_resource(&device.model)
    })
}

/// What discovery hands to the device-state controller.
pub struct Discovered {
    pub inventory: Inventory,
    /// Present only when partitioning is enabled.
    pub partitions: Option<Arc<PartitionManager>>,
}

/// Publish `npu-<logical>-0` for every card and, with partitioning, register
/// each card with a fresh partition manager.
pub fn enumerate_devices(
    manager: &dyn DeviceManager,
    catalog: TemplateCatalog,
    driver_name: &str,
    node_name: &str,
    partitioning: bool,
) -> PluginResult<Discovered> {
    let inventory = Inventory::new(driver_name, node_name, partitioning);
    let partitions = partitioning.then(|| Arc::new(PartitionManager::new(catalog)));

    for device in manager.devices()? {
        let name = match &partitions {
            Some(p) => p.init_physical_device(device.logic_id, device.phy_id, &device.model),
            None => DeviceName::full_card(device.logic_id).to_string(),
        };
        // Unsplit cards advertise their full hardware capacity.
        let resources = partitions
            .is_some()
            .then(|| (fetch_ai_core(manager, &device), fetch_memory(manager, &device)));
        inventory.insert(inventory.describe(
            &name,
            device.logic_id,
            &device.model,
            "NPU",
            resources,
        ));
        info!(device = %name, model = %device.model, "discovered NPU device");
    }

    Ok(Discovered {
        inventory,
        partitions,
    })
}
