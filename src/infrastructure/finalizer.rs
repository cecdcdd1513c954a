//! Orchestrates reconstructing a runnable environment from an extracted
//! configuration directory (`spec.md` §4.I, §4.J).

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::domain::resolution::{promoted_criticality, DownloadExecutor, DownloadRequest};
use crate::domain::workflow::{Criticality, ReferenceStatus};
use crate::domain::Manifest;
use crate::hash::QuickHash;
use crate::infrastructure::analyzer::ModelStrategy;
use crate::infrastructure::downloader::{DownloadError, Downloader};
use crate::infrastructure::git::{GitCollaborator, GitError};
use crate::infrastructure::index::ModelIndex;
use crate::infrastructure::installer::{InstallerError, PythonInstaller};

const COMFYUI_REPOSITORY: &str = "https://github.com/comfyanonymous/ComfyUI";

/// Only a failure in the `clone` phase aborts the pipeline
/// (`spec.md` §4.J "Import pipeline").
#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("cloning ComfyUI failed: {0}")]
    Clone(#[source] GitError),

    #[error("target directory {0} already exists")]
    TargetExists(PathBuf),

    #[error("archive layout is invalid: {0}")]
    ArchiveInvalid(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Phase boundaries emitted during finalization, in order
/// (`spec.md` §4.I step 7, §4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    CloneComfyUi,
    InstallDeps,
    CopyWorkflows,
    SyncNodes,
    ResolveModels,
    Done,
}

/// Per-item events raised within a phase.
#[derive(Debug, Clone)]
pub enum ItemEvent {
    NodeInstalled(String),
    NodeFailed(String, String),
    WorkflowCopied(String),
    WorkflowFailed(String, String),
    ModelResolved(QuickHash),
    ModelFailed(QuickHash, String),
}

/// What succeeded and what failed (`spec.md` §4.I "Partial success is not
/// failure").
#[derive(Debug, Default)]
pub struct ImportResult {
    pub nodes_installed: Vec<String>,
    pub nodes_failed: Vec<(String, String)>,
    pub workflows_copied: Vec<String>,
    pub workflows_failed: Vec<(String, String)>,
    pub models_resolved: Vec<QuickHash>,
    pub models_failed: Vec<(QuickHash, String)>,
    pub models_skipped: Vec<QuickHash>,
    pub dependencies_failed: Option<String>,
}

/// Everything the finalizer needs from its collaborators, bundled so the
/// call site doesn't thread five separate parameters through every call.
pub struct FinalizeContext<'a> {
    pub config_dir: &'a Path,
    pub environment_dir: &'a Path,
    pub cache_dir: &'a Path,
    pub strategy: ModelStrategy,
    pub git: &'a dyn GitCollaborator,
    pub installer: &'a dyn PythonInstaller,
    pub index: &'a ModelIndex,
    pub downloader: &'a mut Downloader,
}

/// Run the full import pipeline: clone, install deps, install nodes, copy
/// workflows, acquire models, rewrite paths.
///
/// # Errors
///
/// Returns [`FinalizeError`] only for the catastrophic failures named in
/// `spec.md` §4.I: an invalid archive layout, a target directory that
/// already exists, or a failed ComfyUI clone. All other per-item failures
/// are collected into the returned [`ImportResult`].
pub fn finalize(
    manifest: &mut Manifest,
    ctx: &mut FinalizeContext<'_>,
    mut on_phase: impl FnMut(Phase),
    mut on_item: impl FnMut(ItemEvent),
) -> Result<ImportResult, FinalizeError> {
    if ctx.environment_dir.exists() {
        return Err(FinalizeError::TargetExists(ctx.environment_dir.to_path_buf()));
    }
    if !ctx.config_dir.join("pyproject.toml").is_file() {
        return Err(FinalizeError::ArchiveInvalid(
            "configuration directory has no pyproject.toml".to_string(),
        ));
    }

    let mut result = ImportResult::default();

    on_phase(Phase::CloneComfyUi);
    clone_comfyui(manifest, ctx)?;

    on_phase(Phase::InstallDeps);
    result.dependencies_failed = install_dependencies(ctx).err();

    on_phase(Phase::CopyWorkflows);
    copy_workflows(manifest, ctx, &mut result, &mut on_item)?;

    on_phase(Phase::SyncNodes);
    sync_nodes(manifest, ctx, &mut result, &mut on_item);

    on_phase(Phase::ResolveModels);
    resolve_models(manifest, ctx, &mut result, &mut on_item);
    rewrite_workflow_paths(manifest, ctx)?;

    on_phase(Phase::Done);
    Ok(result)
}

fn clone_comfyui(manifest: &Manifest, ctx: &FinalizeContext<'_>) -> Result<(), FinalizeError> {
    let revision = manifest.meta.comfyui_version.value();
    let target = ctx.environment_dir.join("ComfyUI");
    let cached = ctx.cache_dir.join("comfyui").join(revision);

    if cached.is_dir() {
        copy_dir_recursive(&cached, &target)?;
        return Ok(());
    }

    ctx.git
        .clone_repo(COMFYUI_REPOSITORY, &target, Some(revision), None)
        .map_err(FinalizeError::Clone)?;

    if let Some(parent) = cached.parent() {
        fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
    }
    let _ = copy_dir_recursive(&target, &cached);
    Ok(())
}

fn install_dependencies(ctx: &FinalizeContext<'_>) -> Result<(), String> {
    let manifest_path = ctx.config_dir.join("pyproject.toml");
    ctx.installer
        .sync_project(&manifest_path, false)
        .map_err(|err: InstallerError| err.to_string())
}

fn copy_workflows(
    manifest: &Manifest,
    ctx: &FinalizeContext<'_>,
    result: &mut ImportResult,
    on_item: &mut impl FnMut(ItemEvent),
) -> Result<(), FinalizeError> {
    let target_dir = ctx.environment_dir.join("workflows");
    fs::create_dir_all(&target_dir).map_err(|source| io_error(&target_dir, source))?;

    for workflow in manifest.workflows() {
        let source_path = ctx.config_dir.join(&workflow.path);
        let target_path = target_dir.join(
            Path::new(&workflow.path)
                .strip_prefix("workflows")
                .unwrap_or_else(|_| Path::new(&workflow.path)),
        );
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent).map_err(|source| io_error(parent, source))?;
        }
        match fs::copy(&source_path, &target_path) {
            Ok(_) => {
                result.workflows_copied.push(workflow.name.clone());
                on_item(ItemEvent::WorkflowCopied(workflow.name.clone()));
            }
            Err(source) => {
                let message = source.to_string();
                result.workflows_failed.push((workflow.name.clone(), message.clone()));
                on_item(ItemEvent::WorkflowFailed(workflow.name.clone(), message));
            }
        }
    }
    Ok(())
}

fn sync_nodes(
    manifest: &Manifest,
    ctx: &mut FinalizeContext<'_>,
    result: &mut ImportResult,
    on_item: &mut impl FnMut(ItemEvent),
) {
    use crate::domain::node::NodeSource;

    let custom_nodes_dir = ctx.environment_dir.join("custom_nodes");
    if let Err(source) = fs::create_dir_all(&custom_nodes_dir) {
        for node in manifest.nodes.entries() {
            let message = source.to_string();
            result.nodes_failed.push((node.name.clone(), message.clone()));
            on_item(ItemEvent::NodeFailed(node.name.clone(), message));
        }
        return;
    }

    for node in manifest.nodes.entries() {
        let target = custom_nodes_dir.join(&node.name);
        let outcome = match &node.source {
            NodeSource::Development { local_path } => {
                let source_path = ctx.config_dir.join("dev_nodes").join(local_path);
                copy_dir_recursive(&source_path, &target).map_err(|e| e.to_string())
            }
            NodeSource::Git { url, reference } => ctx
                .git
                .clone_repo(url, &target, reference.as_deref(), None)
                .map_err(|e| e.to_string()),
            NodeSource::Registry { id, version } => {
                fetch_registry_node(id, version.as_deref(), &target).map_err(|e| e.to_string())
            }
        };

        match outcome {
            Ok(()) => {
                result.nodes_installed.push(node.name.clone());
                on_item(ItemEvent::NodeInstalled(node.name.clone()));
            }
            Err(message) => {
                result.nodes_failed.push((node.name.clone(), message.clone()));
                on_item(ItemEvent::NodeFailed(node.name.clone(), message));
            }
        }
    }
}

fn fetch_registry_node(id: &str, version: Option<&str>, target: &Path) -> Result<(), String> {
    let url = match version {
        Some(v) => format!("https://api.comfy.org/nodes/{id}/versions/{v}/download"),
        None => format!("https://api.comfy.org/nodes/{id}/download"),
    };
    let response = reqwest::blocking::get(&url).map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("registry returned {}", response.status()));
    }
    let bytes = response.bytes().map_err(|e| e.to_string())?;
    fs::create_dir_all(target).map_err(|e| e.to_string())?;
    let decoder = flate2::read::GzDecoder::new(&bytes[..]);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(target).map_err(|e| e.to_string())
}

fn resolve_models(
    manifest: &Manifest,
    ctx: &mut FinalizeContext<'_>,
    result: &mut ImportResult,
    on_item: &mut impl FnMut(ItemEvent),
) {
    let hashes: Vec<QuickHash> = manifest.all_models().map(|(hash, _)| hash.clone()).collect();

    for hash in hashes {
        if ctx.index.has_model(&hash) {
            continue;
        }
        let Some(entry) = manifest.get_model(&hash) else {
            continue;
        };

        if ctx.strategy == ModelStrategy::Skip {
            result.models_skipped.push(hash);
            continue;
        }

        let criticality = promoted_criticality(manifest, &hash).unwrap_or(Criticality::Optional);
        let should_attempt = match criticality {
            Criticality::Required => true,
            Criticality::Flexible | Criticality::Optional => ctx.strategy == ModelStrategy::All,
        };
        if !should_attempt {
            result.models_skipped.push(hash);
            continue;
        }

        let Some(url) = entry.source_urls.first().cloned() else {
            result.models_skipped.push(hash);
            continue;
        };

        let request = DownloadRequest {
            url,
            target_relative_path: entry.relative_path.clone(),
        };
        match ctx.downloader.execute(&request) {
            Ok(outcome) => {
                result.models_resolved.push(outcome.hash.clone());
                on_item(ItemEvent::ModelResolved(outcome.hash));
            }
            Err(err) => {
                let message = download_error_message(&err);
                result.models_failed.push((hash.clone(), message.clone()));
                on_item(ItemEvent::ModelFailed(hash, message));
            }
        }
    }
}

fn download_error_message(err: &DownloadError) -> String {
    err.to_string()
}

fn rewrite_workflow_paths(manifest: &Manifest, ctx: &FinalizeContext<'_>) -> Result<(), FinalizeError> {
    for workflow in manifest.workflows() {
        let resolved: Vec<_> = workflow
            .references
            .iter()
            .filter(|r| r.status == ReferenceStatus::Resolved)
            .filter_map(|r| r.hash.as_ref().map(|h| (r, h)))
            .collect();
        if resolved.is_empty() {
            continue;
        }

        let workflow_path = ctx.environment_dir.join("workflows").join(
            Path::new(&workflow.path)
                .strip_prefix("workflows")
                .unwrap_or_else(|_| Path::new(&workflow.path)),
        );
        let Ok(bytes) = fs::read(&workflow_path) else {
            continue;
        };
        let Ok(mut graph) = serde_json::from_slice::<serde_json::Value>(&bytes) else {
            continue;
        };

        let mut changed = false;
        for (reference, hash) in resolved {
            let Some(entry) = manifest.get_model(hash) else {
                continue;
            };
            if set_widget_value(&mut graph, &reference.node_id, reference.widget_index, &entry.filename) {
                changed = true;
            }
        }

        if changed {
            let rewritten = serde_json::to_vec_pretty(&graph).map_err(|source| FinalizeError::Io {
                path: workflow_path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, source),
            })?;
            write_atomically(&workflow_path, &rewritten)?;
        }
    }
    Ok(())
}

fn set_widget_value(graph: &mut serde_json::Value, node_id: &str, widget_index: usize, value: &str) -> bool {
    let Some(nodes) = graph.get_mut("nodes").and_then(serde_json::Value::as_array_mut) else {
        return false;
    };
    for node in nodes {
        let matches = match node.get("id") {
            Some(serde_json::Value::String(s)) => s == node_id,
            Some(serde_json::Value::Number(n)) => n.to_string() == node_id,
            _ => false,
        };
        if !matches {
            continue;
        }
        let Some(widgets) = node.get_mut("widgets_values").and_then(serde_json::Value::as_array_mut) else {
            return false;
        };
        let Some(slot) = widgets.get_mut(widget_index) else {
            return false;
        };
        *slot = serde_json::Value::String(value.to_string());
        return true;
    }
    false
}

fn copy_dir_recursive(source: &Path, target: &Path) -> Result<(), FinalizeError> {
    fs::create_dir_all(target).map_err(|e| io_error(target, e))?;
    for entry in walkdir::WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| FinalizeError::Io {
            path: source.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;
        let relative = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&destination).map_err(|e| io_error(&destination, e))?;
        } else {
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            }
            fs::copy(entry.path(), &destination).map_err(|e| io_error(&destination, e))?;
        }
    }
    Ok(())
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), FinalizeError> {
    let temp_path = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });
    fs::write(&temp_path, bytes).map_err(|e| io_error(&temp_path, e))?;
    fs::rename(&temp_path, path).map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, source: std::io::Error) -> FinalizeError {
    FinalizeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_widget_value_updates_the_matching_node_and_slot() {
        let mut graph = serde_json::json!({
            "nodes": [
                { "id": 1, "type": "CheckpointLoaderSimple", "widgets_values": ["old.safetensors"] }
            ]
        });
        assert!(set_widget_value(&mut graph, "1", 0, "new.safetensors"));
        assert_eq!(graph["nodes"][0]["widgets_values"][0], "new.safetensors");
    }

    #[test]
    fn set_widget_value_is_a_no_op_for_an_absent_node() {
        let mut graph = serde_json::json!({ "nodes": [] });
        assert!(!set_widget_value(&mut graph, "1", 0, "new.safetensors"));
    }

    #[test]
    fn copy_dir_recursive_mirrors_the_whole_tree() {
        let source = tempfile::tempdir().unwrap();
        fs::create_dir_all(source.path().join("nested")).unwrap();
        fs::write(source.path().join("nested/file.txt"), b"hello").unwrap();

        let target = tempfile::tempdir().unwrap();
        let dest = target.path().join("copy");
        copy_dir_recursive(source.path(), &dest).unwrap();

        assert_eq!(fs::read(dest.join("nested/file.txt")).unwrap(), b"hello");
    }
}
