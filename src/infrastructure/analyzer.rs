//! Read-only preview of an extracted manifest, ahead of finalization
//! (`spec.md` §4.H).

use std::collections::HashMap;

use crate::domain::manifest::ComfyUiVersion;
use crate::domain::node::NodeSource;
use crate::domain::resolution::promoted_criticality;
use crate::domain::workflow::Criticality;
use crate::domain::Manifest;
use crate::hash::QuickHash;

/// Which models the finalizer should attempt to acquire (`spec.md` §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelStrategy {
    All,
    Required,
    Skip,
}

/// Per-model analysis row.
#[derive(Debug, Clone)]
pub struct ModelSummary {
    pub hash: QuickHash,
    pub filename: String,
    pub source_urls: Vec<String>,
    pub referenced_by: Vec<String>,
    pub criticality: Criticality,
    pub available_locally: bool,
}

/// Node counts grouped by source kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeCounts {
    pub registry: usize,
    pub git: usize,
    pub development: usize,
}

/// The full read-only report (`spec.md` §4.H).
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub comfyui_pin: String,
    pub workflow_count: usize,
    pub node_counts: NodeCounts,
    pub total_models: usize,
    pub available_locally: usize,
    pub need_download: usize,
    pub lacking_sources: usize,
    pub models: Vec<ModelSummary>,
}

impl AnalysisReport {
    /// `spec.md` §4.H `recommend_strategy`.
    #[must_use]
    pub fn recommend_strategy(&self) -> ModelStrategy {
        if self.need_download == 0 && self.lacking_sources == 0 {
            ModelStrategy::Skip
        } else if self
            .models
            .iter()
            .any(|m| !m.available_locally && m.source_urls.is_empty() && m.criticality == Criticality::Required)
        {
            ModelStrategy::Required
        } else {
            ModelStrategy::All
        }
    }
}

/// Analyze `manifest` against what `locally_available` reports as present
/// by hash (supplied by the caller, typically the model index of the
/// workspace the environment is being imported into).
#[must_use]
pub fn analyze(manifest: &Manifest, locally_available: &dyn Fn(&QuickHash) -> bool) -> AnalysisReport {
    let comfyui_pin = pin_description(&manifest.meta.comfyui_version);
    let mut node_counts = NodeCounts::default();
    for node in manifest.nodes.entries() {
        match &node.source {
            NodeSource::Registry { .. } => node_counts.registry += 1,
            NodeSource::Git { .. } => node_counts.git += 1,
            NodeSource::Development { .. } => node_counts.development += 1,
        }
    }

    let mut referenced_by: HashMap<QuickHash, Vec<String>> = HashMap::new();
    for workflow in manifest.workflows() {
        for reference in &workflow.references {
            if let Some(hash) = &reference.hash {
                referenced_by
                    .entry(hash.clone())
                    .or_default()
                    .push(workflow.name.clone());
            }
        }
    }

    let mut available_locally = 0;
    let mut need_download = 0;
    let mut lacking_sources = 0;
    let mut models = Vec::new();

    for (hash, entry) in manifest.all_models() {
        let available = locally_available(hash);
        let criticality = promoted_criticality(manifest, hash).unwrap_or(Criticality::Optional);
        if available {
            available_locally += 1;
        } else if entry.source_urls.is_empty() {
            lacking_sources += 1;
        } else {
            need_download += 1;
        }
        models.push(ModelSummary {
            hash: hash.clone(),
            filename: entry.filename.clone(),
            source_urls: entry.source_urls.clone(),
            referenced_by: referenced_by.get(hash).cloned().unwrap_or_default(),
            criticality,
            available_locally: available,
        });
    }

    AnalysisReport {
        comfyui_pin,
        workflow_count: manifest.workflows().count(),
        node_counts,
        total_models: models.len(),
        available_locally,
        need_download,
        lacking_sources,
        models,
    }
}

fn pin_description(version: &ComfyUiVersion) -> String {
    match version {
        ComfyUiVersion::Release { comfyui_version } => format!("release {comfyui_version}"),
        ComfyUiVersion::Branch { comfyui_version } => format!("branch {comfyui_version}"),
        ComfyUiVersion::Commit { comfyui_version } => format!("commit {comfyui_version}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::category::Category;
    use crate::domain::manifest::{EnvironmentMeta, GlobalModelEntry};
    use crate::domain::workflow::{ModelReference, Workflow};

    fn manifest_with_one_unresolved_required_model() -> Manifest {
        let mut manifest = Manifest::new(EnvironmentMeta {
            comfyui_version: ComfyUiVersion::Release {
                comfyui_version: "v0.3.0".to_string(),
            },
            python_version: "3.11".to_string(),
        });
        manifest.add_model(
            QuickHash::from("abc"),
            GlobalModelEntry {
                filename: "m.safetensors".to_string(),
                size: 100,
                relative_path: "checkpoints/m.safetensors".to_string(),
                category: Category::from("checkpoints"),
                source_urls: Vec::new(),
            },
        );
        let mut reference = ModelReference::unresolved(
            "1".to_string(),
            "CheckpointLoaderSimple".to_string(),
            0,
            "m.safetensors".to_string(),
            Category::from("checkpoints"),
        );
        reference.mark_resolved(QuickHash::from("abc"));
        let mut workflow = Workflow::new("w".to_string(), "workflows/w.json".to_string());
        workflow.references.push(reference);
        manifest.put_workflow(workflow);
        manifest
    }

    #[test]
    fn recommend_strategy_is_required_when_a_required_model_has_no_source() {
        let manifest = manifest_with_one_unresolved_required_model();
        let report = analyze(&manifest, &|_| false);
        assert_eq!(report.lacking_sources, 1);
        assert_eq!(report.recommend_strategy(), ModelStrategy::Required);
    }

    #[test]
    fn recommend_strategy_is_skip_when_everything_is_local() {
        let manifest = manifest_with_one_unresolved_required_model();
        let report = analyze(&manifest, &|_| true);
        assert_eq!(report.available_locally, 1);
        assert_eq!(report.recommend_strategy(), ModelStrategy::Skip);
    }
}
