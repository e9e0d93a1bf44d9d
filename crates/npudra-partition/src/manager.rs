//! PartitionManager: slice allocation over the node's physical NPUs.
//!
//! Every operation takes one coarse lock over the whole registry. Slice
//! counts per card are small, so a single mutex keeps the available /
//! allocated bookkeeping trivially consistent.
//!
//! Allocation comes in two shapes:
//! - **Full card**: both requested quantities are zero; the slice named by
//!   the request moves to the allocated list as-is.
//! - **Template**: the best-fitting supported template is stamped on the
//!   requested slice and a new remainder slice is appended to the card.
//!   The registered [`SubdivisionObserver`] hears about the remainder before
//!   the lock is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use npudra_core::DeviceName;

use crate::device::{PhysicalDevice, Slice, SliceKind};
use crate::error::{PartitionError, PartitionResult};
use crate::template::{PartitionTemplate, TemplateCatalog, best_fit};

/// Receives newly materialized remainder slices.
///
/// Called synchronously while the manager lock is held, so implementations
/// must not call back into the [`PartitionManager`].
pub trait SubdivisionObserver: Send + Sync {
    fn slice_created(&self, slice_id: &str, device: &PhysicalDevice);
}

struct Registry {
    /// Cards keyed by logical index.
    devices: BTreeMap<u32, PhysicalDevice>,
    observer: Option<Arc<dyn SubdivisionObserver>>,
}

/// Owns the physical device registry and the template catalog.
pub struct PartitionManager {
    catalog: TemplateCatalog,
    registry: Mutex<Registry>,
}

impl PartitionManager {
    pub fn new(catalog: TemplateCatalog) -> Self {
        Self {
            catalog,
            registry: Mutex::new(Registry {
                devices: BTreeMap::new(),
                observer: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a card with its full-card slice. Returns the published
    /// device name. Re-registering a logical index replaces the record.
    pub fn init_physical_device(&self, logical_index: u32, physical_id: u32, model: &str) -> String {
        let templates = self.catalog.templates_for_model(model);
        let device = PhysicalDevice::new(logical_index, physical_id, model, templates);
        let device_name = device.device_name.clone();
        debug!(
            device = %device_name,
            model,
            templates = device.supported_templates.len(),
            "physical NPU registered"
        );
        self.lock().devices.insert(logical_index, device);
        device_name
    }

    /// Install the subdivision observer. The last one installed wins.
    pub fn set_observer(&self, observer: Arc<dyn SubdivisionObserver>) {
        self.lock().observer = Some(observer);
    }

    pub fn template(&self, name: &str) -> Option<PartitionTemplate> {
        self.catalog.get(name).cloned()
    }

    /// Allocate a slice of `device_name`.
    ///
    /// Zero for both quantities means the whole slice as-is; anything else
    /// runs the best-fit template search and subdivides the card.
    pub fn allocate_slice(
        &self,
        device_name: &str,
        ai_core: u32,
        memory_gb: u32,
    ) -> PartitionResult<Slice> {
        let mut registry = self.lock();
        let Registry { devices, observer } = &mut *registry;
        debug!(device = device_name, ai_core, memory_gb, "allocating slice");

        let device = resolve_device(devices, device_name)?;
        if ai_core == 0 && memory_gb == 0 {
            return allocate_full_card(device, device_name);
        }
        allocate_by_template(device, observer.as_deref(), device_name, ai_core, memory_gb)
    }

    /// Return an allocated slice to its card's available list.
    ///
    /// The slice keeps its id, template and kind; released slices are never
    /// merged back into a larger one.
    pub fn release_slice(&self, slice_id: &str) -> PartitionResult<()> {
        let mut registry = self.lock();
        for device in registry.devices.values_mut() {
            if let Some(mut slice) = device.take_allocated(slice_id) {
                slice.allocated = false;
                device.available_slices.push(slice);
                info!(slice = slice_id, "slice released");
                return Ok(());
            }
        }
        Err(PartitionError::NotFound(format!(
            "slice {slice_id} is not allocated"
        )))
    }

    /// Template an allocated slice was carved with, `None` for full-card use.
    pub fn vnpu_spec(&self, slice_id: &str) -> PartitionResult<Option<String>> {
        let registry = self.lock();
        registry
            .devices
            .values()
            .flat_map(|d| d.allocated_slices.iter())
            .find(|s| s.slice_id == slice_id)
            .map(|s| s.template_name.clone())
            .ok_or_else(|| PartitionError::NotFound(format!("slice {slice_id} is not allocated")))
    }

    /// Re-mark a checkpointed slice as allocated after a restart.
    ///
    /// Slices the fresh registry does not know yet are synthesized as
    /// virtual slices and the card's slice counter is moved past them. A
    /// template-stamped slice that is the newest one on its card gets the
    /// remainder it was carved with. Returns the remainder id, if one was
    /// created. Restoring an already allocated slice is a no-op.
    pub fn restore_slice(
        &self,
        slice_id: &str,
        template_name: Option<&str>,
    ) -> PartitionResult<Option<String>> {
        let mut registry = self.lock();
        let Registry { devices, observer } = &mut *registry;
        let device = resolve_device(devices, slice_id)?;
        if device.is_allocated(slice_id) {
            return Ok(None);
        }

        let parsed = DeviceName::parse(slice_id)
            .ok_or_else(|| PartitionError::NotFound(slice_id.to_string()))?;
        let mut slice = device
            .take_available(slice_id)
            .unwrap_or_else(|| Slice::remainder(slice_id.to_string()));
        let newest = parsed.slice_index + 1 >= device.next_slice_index;
        device.next_slice_index = device.next_slice_index.max(parsed.slice_index + 1);

        slice.allocated = true;
        slice.template_name = template_name.map(String::from);
        device.allocated_slices.push(slice);
        debug!(slice = slice_id, template = ?template_name, "slice restored from checkpoint");

        if template_name.is_some() && newest {
            return Ok(Some(subdivide(device, observer.as_deref())));
        }
        Ok(None)
    }

    /// Next slice index per card, by logical index.
    pub fn slice_counters(&self) -> BTreeMap<u32, u32> {
        self.lock()
            .devices
            .iter()
            .map(|(index, device)| (*index, device.next_slice_index))
            .collect()
    }

    /// Move a card's slice counter forward to a persisted value and
    /// republish every remainder id below it that the registry lacks.
    /// Counters never go down. Returns the republished ids.
    pub fn restore_slice_counter(
        &self,
        logical_index: u32,
        next_slice_index: u32,
    ) -> PartitionResult<Vec<String>> {
        let mut registry = self.lock();
        let Registry { devices, observer } = &mut *registry;
        let device = devices.get_mut(&logical_index).ok_or_else(|| {
            PartitionError::NotFound(format!("physical NPU with logical index {logical_index}"))
        })?;

        let mut republished = Vec::new();
        while device.next_slice_index < next_slice_index {
            let slice_id = device.next_remainder_id();
            if device.slice(&slice_id).is_none() {
                device
                    .available_slices
                    .push(Slice::remainder(slice_id.clone()));
                if let Some(observer) = observer.as_deref() {
                    observer.slice_created(&slice_id, device);
                }
                republished.push(slice_id);
            }
            device.next_slice_index += 1;
        }
        if !republished.is_empty() {
            debug!(
                card = logical_index,
                next = device.next_slice_index,
                slices = ?republished,
                "remainder slices republished"
            );
        }
        Ok(republished)
    }

    /// Snapshot of the card a device or slice name belongs to.
    pub fn physical_device(&self, name: &str) -> Option<PhysicalDevice> {
        let parsed = DeviceName::parse(name)?;
        self.lock().devices.get(&parsed.logical_index).cloned()
    }

    /// Snapshot of every registered card, by logical index.
    pub fn physical_devices(&self) -> Vec<PhysicalDevice> {
        self.lock().devices.values().cloned().collect()
    }

    /// Supported templates per model name across all cards.
    pub fn model_templates(&self) -> BTreeMap<String, BTreeMap<String, PartitionTemplate>> {
        let registry = self.lock();
        let mut models: BTreeMap<String, BTreeMap<String, PartitionTemplate>> = BTreeMap::new();
        for device in registry.devices.values() {
            let model = if device.model_name.is_empty() {
                "unknown".to_string()
            } else {
                device.model_name.clone()
            };
            models
                .entry(model)
                .or_default()
                .extend(device.supported_templates.clone());
        }
        models
    }
}

/// Find the card a device or slice name lives on.
fn resolve_device<'a>(
    devices: &'a mut BTreeMap<u32, PhysicalDevice>,
    name: &str,
) -> PartitionResult<&'a mut PhysicalDevice> {
    DeviceName::parse(name)
        .and_then(|parsed| devices.get_mut(&parsed.logical_index))
        .ok_or_else(|| PartitionError::NotFound(format!("physical NPU for {name}")))
}

fn allocate_full_card(device: &mut PhysicalDevice, device_name: &str) -> PartitionResult<Slice> {
    let Some(mut slice) = device.take_available(device_name) else {
        return Err(PartitionError::NotFound(format!(
            "slice {device_name} is unknown or already allocated"
        )));
    };
    slice.allocated = true;
    device.allocated_slices.push(slice.clone());
    info!(slice = device_name, "full NPU slice allocated");
    Ok(slice)
}

fn allocate_by_template(
    device: &mut PhysicalDevice,
    observer: Option<&dyn SubdivisionObserver>,
    device_name: &str,
    ai_core: u32,
    memory_gb: u32,
) -> PartitionResult<Slice> {
    let template = best_fit(&device.supported_templates, ai_core, memory_gb)
        .cloned()
        .ok_or(PartitionError::NoMatchingTemplate { ai_core, memory_gb })?;

    let Some(mut slice) = device.take_available(device_name) else {
        warn!(slice = device_name, "no available slice to carve");
        return Err(PartitionError::SliceNotFound(device_name.to_string()));
    };
    slice.template_name = Some(template.name.clone());
    slice.allocated = true;
    device.allocated_slices.push(slice.clone());

    let remainder = subdivide(device, observer);
    info!(
        slice = device_name,
        template = %template.name,
        ai_core = template.ai_core,
        memory_gb = template.memory_gb,
        %remainder,
        "vNPU slice allocated"
    );
    Ok(slice)
}

/// Append a fresh remainder slice, notify the observer, bump the counter.
fn subdivide(device: &mut PhysicalDevice, observer: Option<&dyn SubdivisionObserver>) -> String {
    let remainder_id = device.next_remainder_id();
    device
        .available_slices
        .push(Slice::remainder(remainder_id.clone()));
    if let Some(observer) = observer {
        observer.slice_created(&remainder_id, device);
    }
    device.next_slice_index += 1;
    remainder_id
}
