//! Physical device and slice records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use npudra_core::DeviceName;

use crate::template::PartitionTemplate;

/// Whether a slice stands for the whole card or a carved-out vNPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SliceKind {
    FullCard,
    Virtual,
}

impl SliceKind {
    /// Device type attribute published for slices of this kind.
    pub fn device_type(&self) -> &'static str {
        match self {
            SliceKind::FullCard => "NPU",
            SliceKind::Virtual => "vNPU",
        }
    }
}

/// The atomic allocatable unit of a physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    pub slice_id: String,
    /// Template stamped on allocation; `None` for full-card use and fresh remainders.
    pub template_name: Option<String>,
    pub allocated: bool,
    pub kind: SliceKind,
}

impl Slice {
    pub fn full_card(slice_id: &str) -> Self {
        Self {
            slice_id: slice_id.to_string(),
            template_name: None,
            allocated: false,
            kind: SliceKind::FullCard,
        }
    }

    pub fn remainder(slice_id: String) -> Self {
        Self {
            slice_id,
            template_name: None,
            allocated: false,
            kind: SliceKind::Virtual,
        }
    }
}

/// One NPU card and the slices carved out of it.
///
/// A slice id lives in exactly one of `available_slices` and
/// `allocated_slices`. `next_slice_index` never goes down, so remainder ids
/// are never reused on a card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalDevice {
    pub device_name: String,
    pub physical_id: u32,
    pub logical_index: u32,
    pub model_name: String,
    pub available_slices: Vec<Slice>,
    pub allocated_slices: Vec<Slice>,
    pub supported_templates: BTreeMap<String, PartitionTemplate>,
    pub next_slice_index: u32,
}

impl PhysicalDevice {
    /// A card with its single full-card slice, published as `npu-<logical>-0`.
    pub fn new(
        logical_index: u32,
        physical_id: u32,
        model_name: &str,
        supported_templates: BTreeMap<String, PartitionTemplate>,
    ) -> Self {
        let device_name = DeviceName::full_card(logical_index).to_string();
        Self {
            available_slices: vec![Slice::full_card(&device_name)],
            allocated_slices: Vec::new(),
            device_name,
            physical_id,
            logical_index,
            model_name: model_name.to_string(),
            supported_templates,
            next_slice_index: 1,
        }
    }

    /// Remove an available, unallocated slice from the available list.
    pub(crate) fn take_available(&mut self, slice_id: &str) -> Option<Slice> {
        let pos = self
            .available_slices
            .iter()
            .position(|s| s.slice_id == slice_id && !s.allocated)?;
        Some(self.available_slices.remove(pos))
    }

    /// Remove a slice from the allocated list.
    pub(crate) fn take_allocated(&mut self, slice_id: &str) -> Option<Slice> {
        let pos = self
            .allocated_slices
            .iter()
            .position(|s| s.slice_id == slice_id)?;
        Some(self.allocated_slices.remove(pos))
    }

    /// Look a slice up in either list.
    pub fn slice(&self, slice_id: &str) -> Option<&Slice> {
        self.available_slices
            .iter()
            .chain(self.allocated_slices.iter())
            .find(|s| s.slice_id == slice_id)
    }

    pub fn is_allocated(&self, slice_id: &str) -> bool {
        self.allocated_slices.iter().any(|s| s.slice_id == slice_id)
    }

    /// Id the next remainder slice will get.
    pub fn next_remainder_id(&self) -> String {
        DeviceName::slice(self.logical_index, self.next_slice_index).to_string()
    }

    /// Largest AI-core and memory quota over the supported templates.
    pub fn max_template_resources(&self) -> (u32, u32) {
        self.supported_templates
            .values()
            .fold((0, 0), |(ai_core, memory), t| {
                (ai_core.max(t.ai_core), memory.max(t.memory_gb))
            })
    }

    /// True when no slice id repeats across the two lists.
    pub fn slices_disjoint(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.available_slices
            .iter()
            .chain(self.allocated_slices.iter())
            .all(|s| seen.insert(s.slice_id.as_str()))
    }
}
