//! The environment manifest: a single declarative document per environment
//! (`spec.md` §3.4). Persistence lives in `infrastructure::manifest_store`;
//! this module holds the typed document and its structural invariants.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::domain::category::Category;
use crate::domain::node::NodeTable;
use crate::domain::workflow::{ReferenceStatus, Workflow};
use crate::hash::QuickHash;

/// Discriminates how `comfyui_version` should be interpreted, per
/// `spec.md` §3.4 and §6.1.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "comfyui_version_type", rename_all = "snake_case")]
pub enum ComfyUiVersion {
    Release { comfyui_version: String },
    Branch { comfyui_version: String },
    Commit { comfyui_version: String },
}

impl ComfyUiVersion {
    #[must_use]
    pub fn value(&self) -> &str {
        match self {
            Self::Release { comfyui_version }
            | Self::Branch { comfyui_version }
            | Self::Commit { comfyui_version } => comfyui_version,
        }
    }
}

/// Environment-wide metadata: the ComfyUI pin and the Python version pin.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EnvironmentMeta {
    pub comfyui_version: ComfyUiVersion,
    pub python_version: String,
}

/// A row of the global model table: everything about a resolved hash that
/// doesn't belong to the index (`spec.md` §3.4).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GlobalModelEntry {
    pub filename: String,
    pub size: u64,
    pub relative_path: String,
    pub category: Category,
    pub source_urls: Vec<String>,
}

/// Errors raised while validating or mutating a manifest document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("workflow '{0}' references hash {1} with no corresponding global model entry")]
    DanglingReference(String, String),
}

/// The full environment document: metadata, nodes, workflows, and the
/// global model table, keyed by quick-hash (`spec.md` §3.4).
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub meta: EnvironmentMeta,
    pub nodes: NodeTable,
    workflows: BTreeMap<String, Workflow>,
    models: BTreeMap<QuickHash, GlobalModelEntry>,
}

impl Manifest {
    #[must_use]
    pub fn new(meta: EnvironmentMeta) -> Self {
        Self {
            meta,
            nodes: NodeTable::default(),
            workflows: BTreeMap::new(),
            models: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn get_workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }

    #[must_use]
    pub fn get_workflow_mut(&mut self, name: &str) -> Option<&mut Workflow> {
        self.workflows.get_mut(name)
    }

    pub fn put_workflow(&mut self, workflow: Workflow) {
        self.workflows.insert(workflow.name.clone(), workflow);
    }

    /// Returns whether a workflow with `name` was present and removed.
    pub fn delete_workflow(&mut self, name: &str) -> bool {
        self.workflows.remove(name).is_some()
    }

    #[must_use]
    pub fn workflows(&self) -> impl Iterator<Item = &Workflow> {
        self.workflows.values()
    }

    #[must_use]
    pub fn get_model(&self, hash: &QuickHash) -> Option<&GlobalModelEntry> {
        self.models.get(hash)
    }

    pub fn add_model(&mut self, hash: QuickHash, entry: GlobalModelEntry) {
        self.models.insert(hash, entry);
    }

    #[must_use]
    pub fn all_models(&self) -> impl Iterator<Item = (&QuickHash, &GlobalModelEntry)> {
        self.models.iter()
    }

    /// Every hash referenced by a resolved workflow reference, deduplicated.
    fn referenced_hashes(&self) -> std::collections::BTreeSet<QuickHash> {
        self.workflows
            .values()
            .flat_map(|w| &w.references)
            .filter(|r| r.status == ReferenceStatus::Resolved)
            .filter_map(|r| r.hash.clone())
            .collect()
    }

    /// Remove global model entries not referenced by any workflow and with
    /// no user-added sources (`spec.md` §4.C).
    pub fn remove_orphan_models(&mut self) {
        let referenced = self.referenced_hashes();
        self.models
            .retain(|hash, entry| referenced.contains(hash) || !entry.source_urls.is_empty());
    }

    /// Structural + reference-integrity validation run on save
    /// (`spec.md` §4.C "Invariants enforced on save").
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::DanglingReference`] for the first resolved
    /// reference whose hash has no global model entry.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for workflow in self.workflows.values() {
            for reference in &workflow.references {
                if reference.status != ReferenceStatus::Resolved {
                    continue;
                }
                let Some(hash) = &reference.hash else {
                    continue;
                };
                if !self.models.contains_key(hash) {
                    return Err(ManifestError::DanglingReference(
                        workflow.name.clone(),
                        hash.to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::workflow::ModelReference;

    fn meta() -> EnvironmentMeta {
        EnvironmentMeta {
            comfyui_version: ComfyUiVersion::Release {
                comfyui_version: "v0.3.0".to_string(),
            },
            python_version: "3.11".to_string(),
        }
    }

    fn model_entry() -> GlobalModelEntry {
        GlobalModelEntry {
            filename: "dreamshaper_8.safetensors".to_string(),
            size: 100,
            relative_path: "checkpoints/dreamshaper_8.safetensors".to_string(),
            category: Category::from("checkpoints"),
            source_urls: Vec::new(),
        }
    }

    #[test]
    fn validate_rejects_a_resolved_reference_with_no_global_entry() {
        let mut manifest = Manifest::new(meta());
        let mut workflow = Workflow::new("w".to_string(), "workflows/w.json".to_string());
        let mut reference = ModelReference::unresolved(
            "1".to_string(),
            "CheckpointLoaderSimple".to_string(),
            0,
            "dreamshaper_8.safetensors".to_string(),
            Category::from("checkpoints"),
        );
        reference.mark_resolved(QuickHash::from("abc"));
        workflow.references.push(reference);
        manifest.put_workflow(workflow);

        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::DanglingReference(_, _))
        ));

        manifest.add_model(QuickHash::from("abc"), model_entry());
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn remove_orphan_models_keeps_referenced_and_user_sourced_entries() {
        let mut manifest = Manifest::new(meta());
        manifest.add_model(QuickHash::from("referenced"), model_entry());
        let mut user_sourced = model_entry();
        user_sourced.source_urls.push("https://example.com/m.bin".to_string());
        manifest.add_model(QuickHash::from("user-sourced"), user_sourced);
        manifest.add_model(QuickHash::from("orphan"), model_entry());

        let mut workflow = Workflow::new("w".to_string(), "workflows/w.json".to_string());
        let mut reference = ModelReference::unresolved(
            "1".to_string(),
            "CheckpointLoaderSimple".to_string(),
            0,
            "dreamshaper_8.safetensors".to_string(),
            Category::from("checkpoints"),
        );
        reference.mark_resolved(QuickHash::from("referenced"));
        workflow.references.push(reference);
        manifest.put_workflow(workflow);

        manifest.remove_orphan_models();

        assert!(manifest.get_model(&QuickHash::from("referenced")).is_some());
        assert!(manifest.get_model(&QuickHash::from("user-sourced")).is_some());
        assert!(manifest.get_model(&QuickHash::from("orphan")).is_none());
    }
}
