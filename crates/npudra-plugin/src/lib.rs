//! npudra-plugin: the NPU device-state controller.
//!
//! Turns resource claims into prepared devices: resolves the opaque
//! `NpuConfig` attached to a claim, carves vNPU slices through the
//! partition manager, derives container edits, writes CDI specs and keeps
//! a durable checkpoint of everything handed out.
//!
//! # Components
//!
//! - **`claim`**: Resource claim input types
//! - **`config`**: `NpuConfig` decoding, normalization and validation
//! - **`inventory`**: Allocatable device inventory and subdivision observer
//! - **`discovery`**: Device enumeration
//! - **`cdi`**: CDI spec files
//! - **`device_class`**: Predefined device classes
//! - **`state`**: `DeviceState` (prepare, unprepare, restore)

pub mod cdi;
pub mod claim;
pub mod config;
pub mod device_class;
pub mod discovery;
pub mod error;
pub mod inventory;
pub mod state;

pub use cdi::{CdiHandler, CdiSpecWriter};
pub use claim::ResourceClaim;
pub use config::NpuConfig;
pub use device_class::{DeviceClassClient, FileDeviceClassClient, SyncReport, sync_device_classes};
pub use discovery::{DeviceManager, Discovered, StaticDeviceManager, enumerate_devices};
pub use error::{PluginError, PluginResult, ReleaseWarning};
pub use inventory::{AllocatableDevices, DeviceAttribute, DeviceDescriptor, Inventory};
pub use state::{DeviceState, StateConfig};
