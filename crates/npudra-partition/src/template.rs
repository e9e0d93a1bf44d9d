//! Partition templates and the per-model template catalog.
//!
//! A template is a named (AI-core, memory) quota a slice may be carved
//! with. Which templates a card supports depends on its model family,
//! matched by substring against the model name reported by discovery.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use npudra_core::config::{FamilyConfig, TemplateConfig};

/// A named vNPU partition size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionTemplate {
    pub name: String,
    pub ai_core: u32,
    pub memory_gb: u32,
}

impl PartitionTemplate {
    pub fn new(name: &str, ai_core: u32, memory_gb: u32) -> Self {
        Self {
            name: name.to_string(),
            ai_core,
            memory_gb,
        }
    }

    /// Whether this template covers the requested quantities.
    pub fn satisfies(&self, ai_core: u32, memory_gb: u32) -> bool {
        self.ai_core >= ai_core && self.memory_gb >= memory_gb
    }

    /// Wasted capacity if this template serves the request.
    fn waste(&self, ai_core: u32, memory_gb: u32) -> u32 {
        (self.ai_core - ai_core) + (self.memory_gb - memory_gb)
    }
}

/// Models whose name contains `model_match` support `templates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateFamily {
    pub model_match: String,
    pub templates: Vec<String>,
}

/// All templates known to the driver, keyed by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, PartitionTemplate>,
    families: Vec<TemplateFamily>,
}

impl TemplateCatalog {
    /// Build a catalog from templates and families. Family entries naming an
    /// unknown template are dropped.
    pub fn new(templates: Vec<PartitionTemplate>, families: Vec<TemplateFamily>) -> Self {
        let templates: BTreeMap<String, PartitionTemplate> = templates
            .into_iter()
            .map(|t| (t.name.clone(), t))
            .collect();
        let families = families
            .into_iter()
            .map(|mut family| {
                family.templates.retain(|name| {
                    let known = templates.contains_key(name);
                    if !known {
                        warn!(family = %family.model_match, template = %name, "family references unknown template");
                    }
                    known
                });
                family
            })
            .collect();
        Self {
            templates,
            families,
        }
    }

    /// The built-in catalog for Ascend 910 and 310P cards.
    pub fn builtin() -> Self {
        Self::new(
            vec![
                PartitionTemplate::new("vir02", 2, 2),
                PartitionTemplate::new("vir04", 4, 4),
                PartitionTemplate::new("vir08", 8, 8),
                PartitionTemplate::new("vir16", 16, 16),
                PartitionTemplate::new("vir01", 1, 3),
                PartitionTemplate::new("vir02_1c", 2, 6),
                PartitionTemplate::new("vir04_3c", 4, 12),
            ],
            vec![
                TemplateFamily {
                    model_match: "Ascend910".to_string(),
                    templates: vec!["vir02", "vir04", "vir08", "vir16"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                },
                TemplateFamily {
                    model_match: "Ascend310P".to_string(),
                    templates: vec!["vir01", "vir02_1c", "vir04_3c"]
                        .into_iter()
                        .map(String::from)
                        .collect(),
                },
            ],
        )
    }

    /// Build from the driver config, falling back to the built-in catalog
    /// when the config defines no templates.
    pub fn from_config(
        templates: Option<&[TemplateConfig]>,
        families: Option<&[FamilyConfig]>,
    ) -> Self {
        let Some(templates) = templates else {
            return Self::builtin();
        };
        Self::new(
            templates
                .iter()
                .map(|t| PartitionTemplate::new(&t.name, t.aicore, t.memory_gb))
                .collect(),
            families
                .unwrap_or_default()
                .iter()
                .map(|f| TemplateFamily {
                    model_match: f.model_match.clone(),
                    templates: f.templates.clone(),
                })
                .collect(),
        )
    }

    pub fn get(&self, name: &str) -> Option<&PartitionTemplate> {
        self.templates.get(name)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.templates.len()
    }

    /// Templates supported by a model: the union over every matching family.
    pub fn templates_for_model(&self, model: &str) -> BTreeMap<String, PartitionTemplate> {
        self.families
            .iter()
            .filter(|family| model.contains(&family.model_match))
            .flat_map(|family| family.templates.iter())
            .filter_map(|name| self.templates.get(name))
            .map(|t| (t.name.clone(), t.clone()))
            .collect()
    }
}

impl Default for TemplateCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Best-fit search: the smallest template covering both quantities.
///
/// Candidates are visited in name order and only a strictly smaller waste
/// replaces the current pick, so ties go to the lexicographically first name.
pub fn best_fit(
    templates: &BTreeMap<String, PartitionTemplate>,
    ai_core: u32,
    memory_gb: u32,
) -> Option<&PartitionTemplate> {
    let mut best: Option<(&PartitionTemplate, u32)> = None;
    for template in templates.values() {
        if !template.satisfies(ai_core, memory_gb) {
            continue;
        }
        let waste = template.waste(ai_core, memory_gb);
        if best.is_none_or(|(_, best_waste)| waste < best_waste) {
            best = Some((template, waste));
        }
    }
    best.map(|(template, _)| template)
}
