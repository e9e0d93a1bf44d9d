//! The allocatable device inventory published for the node.
//!
//! The inventory sits behind its own `RwLock`, the innermost lock in the
//! driver. The partition manager's subdivision observer writes to it while
//! the manager lock (and often the controller lock) is held, so nothing
//! here may call out to other components.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::info;

use npudra_core::{DeviceName, qualified_attribute};
use npudra_partition::{PhysicalDevice, SubdivisionObserver};

/// A typed device attribute, serialized as `{"int": 8}` or `{"string": "NPU"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAttribute {
    Int(i64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    /// Qualified attribute name (`<driver>/<attr>`) → value.
    pub attributes: BTreeMap<String, DeviceAttribute>,
}

impl DeviceDescriptor {
    pub fn attribute(&self, driver_name: &str, attribute: &str) -> Option<&DeviceAttribute> {
        self.attributes.get(&qualified_attribute(driver_name, attribute))
    }

    pub fn int_attribute(&self, driver_name: &str, attribute: &str) -> Option<i64> {
        match self.attribute(driver_name, attribute)? {
            DeviceAttribute::Int(v) => Some(*v),
            DeviceAttribute::String(_) => None,
        }
    }

    pub fn string_attribute(&self, driver_name: &str, attribute: &str) -> Option<&str> {
        match self.attribute(driver_name, attribute)? {
            DeviceAttribute::String(v) => Some(v),
            DeviceAttribute::Int(_) => None,
        }
    }
}

/// Device name → descriptor.
pub type AllocatableDevices = BTreeMap<String, DeviceDescriptor>;

/// Shared handle to the node's allocatable devices. Clones share state.
#[derive(Debug, Clone)]
pub struct Inventory {
    devices: Arc<RwLock<AllocatableDevices>>,
    driver_name: String,
    node_name: String,
    partitioning: bool,
}

impl Inventory {
    pub fn new(driver_name: &str, node_name: &str, partitioning: bool) -> Self {
        Self {
            devices: Arc::new(RwLock::new(BTreeMap::new())),
            driver_name: driver_name.to_string(),
            node_name: node_name.to_string(),
            partitioning,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AllocatableDevices> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AllocatableDevices> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Build a descriptor with the standard attribute set. `resources` adds
    /// `aicore` and `memory` when partitioning is enabled.
    pub fn describe(
        &self,
        name: &str,
        logical_index: u32,
        model: &str,
        device_type: &str,
        resources: Option<(u32, u32)>,
    ) -> DeviceDescriptor {
        let attr = |a: &str| qualified_attribute(&self.driver_name, a);
        let mut attributes = BTreeMap::from([
            (attr("index"), DeviceAttribute::Int(i64::from(logical_index))),
            (
                attr("uuid"),
                DeviceAttribute::String(format!("{}-{logical_index}", self.node_name)),
            ),
            (attr("model"), DeviceAttribute::String(model.to_string())),
            (attr("type"), DeviceAttribute::String(device_type.to_string())),
            (attr("nodeName"), DeviceAttribute::String(self.node_name.clone())),
        ]);
        if self.partitioning
            && let Some((ai_core, memory_gb)) = resources
        {
            attributes.insert(attr("aicore"), DeviceAttribute::Int(i64::from(ai_core)));
            attributes.insert(attr("memory"), DeviceAttribute::Int(i64::from(memory_gb)));
        }
        DeviceDescriptor {
            name: name.to_string(),
            attributes,
        }
    }

    pub fn insert(&self, descriptor: DeviceDescriptor) {
        self.write().insert(descriptor.name.clone(), descriptor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<DeviceDescriptor> {
        self.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> AllocatableDevices {
        self.read().clone()
    }

    /// Logical index of an inventory device, falling back to its name.
    pub fn logical_index(&self, name: &str) -> Option<u32> {
        self.read()
            .get(name)
            .and_then(|d| d.int_attribute(&self.driver_name, "index"))
            .and_then(|i| u32::try_from(i).ok())
            .or_else(|| DeviceName::parse(name).map(|d| d.logical_index))
    }

    /// Publish a slice of `physical` if it is not in the inventory yet.
    ///
    /// The type follows the slice kind; `aicore`/`memory` are the maxima over
    /// the card's supported templates. Returns true if the device was added.
    pub fn update_allocatable_device(&self, device_name: &str, physical: &PhysicalDevice) -> bool {
        let device_type = physical
            .slice(device_name)
            .map(|s| s.kind.device_type())
            .unwrap_or("NPU");
        let descriptor = self.describe(
            device_name,
            physical.logical_index,
            &physical.model_name,
            device_type,
            Some(physical.max_template_resources()),
        );
        let mut devices = self.write();
        if devices.contains_key(device_name) {
            return false;
        }
        devices.insert(device_name.to_string(), descriptor);
        true
    }
}

impl SubdivisionObserver for Inventory {
    fn slice_created(&self, slice_id: &str, device: &PhysicalDevice) {
        if self.update_allocatable_device(slice_id, device) {
            info!(
                device = slice_id,
                card = %device.device_name,
                "added new device to allocatable devices"
            );
        }
    }
}
