//! npudra-partition: vNPU partitioning for NPU cards.
//!
//! Tracks every physical NPU on the node together with the slices it has
//! been carved into. Slices are created on demand: a template allocation
//! stamps the requested slice with the best-fitting template and appends a
//! fresh remainder slice to the device, which an observer can publish as
//! new allocatable capacity.
//!
//! # Components
//!
//! - **`template`**: Partition templates and the per-model catalog
//! - **`device`**: Physical device and slice records
//! - **`manager`**: `PartitionManager` (allocate, release, restore)

pub mod device;
pub mod error;
pub mod manager;
pub mod template;

pub use device::{PhysicalDevice, Slice, SliceKind};
pub use error::{PartitionError, PartitionResult};
pub use manager::{PartitionManager, SubdivisionObserver};
pub use template::{PartitionTemplate, TemplateCatalog, TemplateFamily};
