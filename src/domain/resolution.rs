//! The workflow resolver (`spec.md` §4.E): binds parsed references to index
//! entries, driving ambiguity resolution through a pluggable strategy.
//!
//! This module only defines ports (`ModelLookup`, `ResolutionStrategy`,
//! `DownloadExecutor`) and the pure algorithm over them — no filesystem or
//! network access happens here. `infrastructure::index` and
//! `infrastructure::downloader` provide the adapters.

use thiserror::Error;

use crate::domain::manifest::Manifest;
use crate::domain::workflow::{Criticality, ModelReference, ReferenceStatus, Workflow};
use crate::hash::QuickHash;

/// A model already known to the index, as seen by the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCandidate {
    pub hash: QuickHash,
    pub relative_path: String,
    pub filename: String,
}

/// Read-only index access the resolver needs. Implemented by
/// `infrastructure::index::ModelIndex`.
pub trait ModelLookup {
    fn find_by_relative_path(&self, relative_path: &str) -> Vec<ModelCandidate>;
    fn find_in_category(&self, filename: &str, category: &str) -> Vec<ModelCandidate>;
    fn still_present(&self, hash: &QuickHash) -> bool;
}

/// A download the strategy asked for but that hasn't run yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub target_relative_path: String,
}

/// What a completed download contributed back to resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub hash: QuickHash,
    pub relative_path: String,
    pub filename: String,
}

/// Runs a download to completion (or fails). Implemented by
/// `infrastructure::downloader::Downloader`.
pub trait DownloadExecutor {
    type Error;
    fn execute(&mut self, request: &DownloadRequest) -> Result<DownloadOutcome, Self::Error>;
}

/// What a strategy decides for an ambiguous or unresolved reference
/// (`spec.md` §9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionDecision {
    Select(ModelCandidate),
    Download(DownloadRequest),
    MarkOptional,
    Skip,
}

/// The capability set a caller supplies to steer ambiguous or unresolved
/// references (`spec.md` §9 "Polymorphism over strategies").
pub trait ResolutionStrategy {
    fn on_ambiguous(
        &mut self,
        candidates: &[ModelCandidate],
        reference: &ModelReference,
    ) -> ResolutionDecision;
    fn on_unresolved(&mut self, reference: &ModelReference) -> ResolutionDecision;
}

/// How a single reference was handled in one `resolve` pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceOutcome {
    Cached,
    AutoResolved(QuickHash),
    Selected(QuickHash),
    Downloaded(QuickHash),
    MarkedOptional,
    Skipped,
    DownloadFailed,
}

/// Errors a resolution pass surfaces without aborting the sweep; one
/// per-reference failure is recorded in `ResolutionResult`, not raised.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("failed to persist manifest during resolution: {0}")]
    Persist(String),
}

/// Result of resolving every reference in a workflow.
#[derive(Debug, Default)]
pub struct ResolutionResult {
    pub outcomes: Vec<(String, usize, ReferenceOutcome)>,
}

impl ResolutionResult {
    #[must_use]
    pub fn unresolved_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, _, outcome)| {
                matches!(
                    outcome,
                    ReferenceOutcome::MarkedOptional
                        | ReferenceOutcome::Skipped
                        | ReferenceOutcome::DownloadFailed
                )
            })
            .count()
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Resolve every reference of `workflow_name` against `lookup`, persisting
/// the manifest after each one via `persist` (`spec.md` §4.E step 4,
/// "Ctrl-C-safe").
///
/// # Errors
///
/// Returns [`ResolutionError::Persist`] if `persist` fails; the caller's
/// manifest reflects every reference resolved before the failure.
pub fn resolve<L, S, D>(
    workflow_name: &str,
    manifest: &mut Manifest,
    lookup: &L,
    strategy: &mut S,
    downloader: &mut D,
    mut persist: impl FnMut(&Manifest) -> Result<(), String>,
) -> Result<ResolutionResult, ResolutionError>
where
    L: ModelLookup,
    S: ResolutionStrategy,
    D: DownloadExecutor,
{
    let mut result = ResolutionResult::default();
    let Some(existing) = manifest.get_workflow(workflow_name) else {
        return Ok(result);
    };
    let reference_keys: Vec<(String, usize, String)> = existing
        .references
        .iter()
        .map(|r| (r.node_id.clone(), r.widget_index, r.widget_value.clone()))
        .collect();

    for (node_id, widget_index, widget_value) in reference_keys {
        let outcome = resolve_one(
            workflow_name,
            &node_id,
            widget_index,
            &widget_value,
            manifest,
            lookup,
            strategy,
            downloader,
        );
        result
            .outcomes
            .push((node_id, widget_index, outcome));
        persist(manifest).map_err(ResolutionError::Persist)?;
    }

    Ok(result)
}

#[allow(clippy::too_many_arguments, reason = "mirrors the resolver's documented per-reference algorithm")]
fn resolve_one<L: ModelLookup, S: ResolutionStrategy, D: DownloadExecutor>(
    workflow_name: &str,
    node_id: &str,
    widget_index: usize,
    widget_value: &str,
    manifest: &mut Manifest,
    lookup: &L,
    strategy: &mut S,
    downloader: &mut D,
) -> ReferenceOutcome {
    // Step 1: cache hit.
    if let Some(workflow) = manifest.get_workflow(workflow_name) {
        if let Some(existing) = workflow.find_reference(node_id, widget_index) {
            if existing.widget_value == widget_value {
                if let (ReferenceStatus::Resolved, Some(hash)) =
                    (existing.status, existing.hash.clone())
                {
                    if lookup.still_present(&hash) {
                        return ReferenceOutcome::Cached;
                    }
                }
            }
        }
    }

    // Step 2: auto-resolve.
    let exact = lookup.find_by_relative_path(widget_value);
    if let [only] = exact.as_slice() {
        let hash = only.hash.clone();
        bind(manifest, workflow_name, node_id, widget_index, hash.clone());
        return ReferenceOutcome::AutoResolved(hash);
    }

    let category = manifest
        .get_workflow(workflow_name)
        .and_then(|w| w.find_reference(node_id, widget_index))
        .map(|r| r.category.as_str().to_string())
        .unwrap_or_default();
    let by_category = lookup.find_in_category(basename(widget_value), &category);
    if let [only] = by_category.as_slice() {
        let hash = only.hash.clone();
        bind(manifest, workflow_name, node_id, widget_index, hash.clone());
        return ReferenceOutcome::AutoResolved(hash);
    }

    // Step 3: strategy prompt.
    let reference = manifest
        .get_workflow(workflow_name)
        .and_then(|w| w.find_reference(node_id, widget_index))
        .cloned();
    let Some(reference) = reference else {
        return ReferenceOutcome::Skipped;
    };
    let candidates = if exact.is_empty() { by_category } else { exact };
    let decision = if candidates.is_empty() {
        strategy.on_unresolved(&reference)
    } else {
        strategy.on_ambiguous(&candidates, &reference)
    };

    match decision {
        ResolutionDecision::Select(candidate) => {
            bind(manifest, workflow_name, node_id, widget_index, candidate.hash.clone());
            ReferenceOutcome::Selected(candidate.hash)
        }
        ResolutionDecision::Download(request) => match downloader.execute(&request) {
            Ok(outcome) => {
                bind(manifest, workflow_name, node_id, widget_index, outcome.hash.clone());
                ReferenceOutcome::Downloaded(outcome.hash)
            }
            Err(_) => ReferenceOutcome::DownloadFailed,
        },
        ResolutionDecision::MarkOptional => {
            if let Some(r) = manifest
                .get_workflow_mut(workflow_name)
                .and_then(|w| w.find_reference_mut(node_id, widget_index))
            {
                r.mark_optional();
            }
            ReferenceOutcome::MarkedOptional
        }
        ResolutionDecision::Skip => ReferenceOutcome::Skipped,
    }
}

fn bind(
    manifest: &mut Manifest,
    workflow_name: &str,
    node_id: &str,
    widget_index: usize,
    hash: QuickHash,
) {
    if let Some(r) = manifest
        .get_workflow_mut(workflow_name)
        .and_then(|w| w.find_reference_mut(node_id, widget_index))
    {
        r.mark_resolved(hash);
    }
}

/// The strongest criticality across every workflow referencing `hash`
/// (`spec.md` §4.E "Criticality promotion").
#[must_use]
pub fn promoted_criticality(manifest: &Manifest, hash: &QuickHash) -> Option<Criticality> {
    manifest
        .workflows()
        .flat_map(|w: &Workflow| &w.references)
        .filter(|r| r.hash.as_ref() == Some(hash))
        .map(|r| r.criticality)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::category::Category;
    use crate::domain::manifest::{ComfyUiVersion, EnvironmentMeta};

    struct StubLookup {
        by_path: Vec<ModelCandidate>,
        by_category: Vec<ModelCandidate>,
        present: Vec<QuickHash>,
    }

    impl ModelLookup for StubLookup {
        fn find_by_relative_path(&self, _relative_path: &str) -> Vec<ModelCandidate> {
            self.by_path.clone()
        }
        fn find_in_category(&self, _filename: &str, _category: &str) -> Vec<ModelCandidate> {
            self.by_category.clone()
        }
        fn still_present(&self, hash: &QuickHash) -> bool {
            self.present.contains(hash)
        }
    }

    struct AlwaysSkip;
    impl ResolutionStrategy for AlwaysSkip {
        fn on_ambiguous(&mut self, _: &[ModelCandidate], _: &ModelReference) -> ResolutionDecision {
            ResolutionDecision::Skip
        }
        fn on_unresolved(&mut self, _: &ModelReference) -> ResolutionDecision {
            ResolutionDecision::Skip
        }
    }

    struct NoDownloads;
    impl DownloadExecutor for NoDownloads {
        type Error = String;
        fn execute(&mut self, _: &DownloadRequest) -> Result<DownloadOutcome, Self::Error> {
            Err("no network in tests".to_string())
        }
    }

    fn manifest_with(reference: ModelReference) -> Manifest {
        let mut manifest = Manifest::new(EnvironmentMeta {
            comfyui_version: ComfyUiVersion::Release {
                comfyui_version: "v0.3.0".to_string(),
            },
            python_version: "3.11".to_string(),
        });
        let mut workflow = Workflow::new("w".to_string(), "workflows/w.json".to_string());
        workflow.references.push(reference);
        manifest.put_workflow(workflow);
        manifest
    }

    fn reference() -> ModelReference {
        ModelReference::unresolved(
            "1".to_string(),
            "CheckpointLoaderSimple".to_string(),
            0,
            "sd15.safetensors".to_string(),
            Category::from("checkpoints"),
        )
    }

    #[test]
    fn exact_path_match_auto_resolves() {
        let mut manifest = manifest_with(reference());
        let lookup = StubLookup {
            by_path: vec![ModelCandidate {
                hash: QuickHash::from("abc"),
                relative_path: "checkpoints/sd15.safetensors".to_string(),
                filename: "sd15.safetensors".to_string(),
            }],
            by_category: Vec::new(),
            present: Vec::new(),
        };
        let result = resolve(
            "w",
            &mut manifest,
            &lookup,
            &mut AlwaysSkip,
            &mut NoDownloads,
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(
            result.outcomes[0].2,
            ReferenceOutcome::AutoResolved(QuickHash::from("abc"))
        );
        assert_eq!(result.unresolved_count(), 0);
    }

    #[test]
    fn ambiguous_category_match_defers_to_strategy() {
        let mut manifest = manifest_with(reference());
        let lookup = StubLookup {
            by_path: Vec::new(),
            by_category: vec![
                ModelCandidate {
                    hash: QuickHash::from("a"),
                    relative_path: "checkpoints/a.safetensors".to_string(),
                    filename: "a.safetensors".to_string(),
                },
                ModelCandidate {
                    hash: QuickHash::from("b"),
                    relative_path: "checkpoints/b.safetensors".to_string(),
                    filename: "b.safetensors".to_string(),
                },
            ],
            present: Vec::new(),
        };
        let result = resolve(
            "w",
            &mut manifest,
            &lookup,
            &mut AlwaysSkip,
            &mut NoDownloads,
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(result.outcomes[0].2, ReferenceOutcome::Skipped);
        assert_eq!(result.unresolved_count(), 1);
    }

    #[test]
    fn cached_resolution_is_reused_when_hash_still_present() {
        let mut r = reference();
        r.mark_resolved(QuickHash::from("abc"));
        let mut manifest = manifest_with(r);
        let lookup = StubLookup {
            by_path: Vec::new(),
            by_category: Vec::new(),
            present: vec![QuickHash::from("abc")],
        };
        let result = resolve(
            "w",
            &mut manifest,
            &lookup,
            &mut AlwaysSkip,
            &mut NoDownloads,
            |_| Ok(()),
        )
        .unwrap();
        assert_eq!(result.outcomes[0].2, ReferenceOutcome::Cached);
    }

    #[test]
    fn promoted_criticality_picks_the_strongest_across_workflows() {
        let mut manifest = Manifest::new(EnvironmentMeta {
            comfyui_version: ComfyUiVersion::Commit {
                comfyui_version: "deadbeef".to_string(),
            },
            python_version: "3.11".to_string(),
        });
        let mut r1 = reference();
        r1.mark_resolved(QuickHash::from("abc"));
        r1.criticality = Criticality::Optional;
        let mut w1 = Workflow::new("w1".to_string(), "workflows/w1.json".to_string());
        w1.references.push(r1);

        let mut r2 = reference();
        r2.mark_resolved(QuickHash::from("abc"));
        r2.criticality = Criticality::Required;
        let mut w2 = Workflow::new("w2".to_string(), "workflows/w2.json".to_string());
        w2.references.push(r2);

        manifest.put_workflow(w1);
        manifest.put_workflow(w2);

        assert_eq!(
            promoted_criticality(&manifest, &QuickHash::from("abc")),
            Some(Criticality::Required)
        );
    }
}
