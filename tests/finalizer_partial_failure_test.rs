//! Scenario: importing an environment whose custom-node source is
//! unreachable and whose one model entry carries no source URL still
//! completes, collecting both as partial failures rather than aborting
//! the whole pipeline (`spec.md` §4.I "Partial success is not failure").

use std::path::Path;

use comfydock_core::domain::{
    Category, ComfyUiVersion, EnvironmentMeta, GlobalModelEntry, Manifest, NodeEntry, NodeSource,
    Workflow,
};
use comfydock_core::infrastructure::{
    finalize, Credentials, Downloader, FinalizeContext, GitCollaborator, GitError, InstallerError,
    ModelIndex, Phase, PythonInstaller,
};
use comfydock_core::QuickHash;

#[derive(Default)]
struct FakeGit;

impl GitCollaborator for FakeGit {
    fn clone_repo(
        &self,
        url: &str,
        target: &Path,
        _reference: Option<&str>,
        _depth: Option<u32>,
    ) -> Result<(), GitError> {
        if url.contains("unreachable") {
            return Err(GitError::Failed {
                command: "clone".to_string(),
                stderr: "could not resolve host".to_string(),
            });
        }
        std::fs::create_dir_all(target).unwrap();
        Ok(())
    }

    fn init(&self, _dir: &Path) -> Result<(), GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn add_all(&self, _dir: &Path) -> Result<(), GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn commit(&self, _dir: &Path, _message: &str) -> Result<(), GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn rev_parse(&self, _dir: &Path, _reference: &str) -> Result<String, GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn current_branch(&self, _dir: &Path) -> Result<String, GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn fetch(&self, _dir: &Path, _remote: &str) -> Result<(), GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn merge(&self, _dir: &Path, _reference: &str, _ff_only: bool) -> Result<(), GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn push(&self, _dir: &Path, _remote: &str, _branch: &str) -> Result<(), GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn remote_add(&self, _dir: &Path, _name: &str, _url: &str) -> Result<(), GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn remote_remove(&self, _dir: &Path, _name: &str) -> Result<(), GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn remote_list(&self, _dir: &Path) -> Result<Vec<String>, GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn remote_get_url(&self, _dir: &Path, _name: &str) -> Result<String, GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn reset_hard(&self, _dir: &Path, _commit: &str) -> Result<(), GitError> {
        unimplemented!("not exercised by the import pipeline")
    }
}

#[derive(Default)]
struct FakeInstaller;

impl PythonInstaller for FakeInstaller {
    fn sync_project(&self, _manifest_path: &Path, _verbose: bool) -> Result<(), InstallerError> {
        Ok(())
    }
    fn add(&self, _project_dir: &Path, _specifier: &str, _group: comfydock_core::infrastructure::DependencyGroup) -> Result<(), InstallerError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn remove(&self, _project_dir: &Path, _specifier: &str, _group: comfydock_core::infrastructure::DependencyGroup) -> Result<(), InstallerError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn list(&self, _project_dir: &Path, _group: Option<comfydock_core::infrastructure::DependencyGroup>) -> Result<Vec<String>, InstallerError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn lock(&self, _project_dir: &Path) -> Result<(), InstallerError> {
        unimplemented!("not exercised by the import pipeline")
    }
    fn has_uncommitted_changes(&self, _project_dir: &Path) -> Result<bool, InstallerError> {
        unimplemented!("not exercised by the import pipeline")
    }
}

#[test]
fn import_collects_node_and_model_failures_without_aborting() {
    let config_dir = tempfile::tempdir().unwrap();
    std::fs::write(config_dir.path().join("pyproject.toml"), "[project]\nname = \"env\"\n").unwrap();
    std::fs::create_dir_all(config_dir.path().join("workflows")).unwrap();
    std::fs::write(
        config_dir.path().join("workflows/txt2img.json"),
        serde_json::json!({ "nodes": [] }).to_string(),
    )
    .unwrap();

    let mut manifest = Manifest::new(EnvironmentMeta {
        comfyui_version: ComfyUiVersion::Release {
            comfyui_version: "v0.3.0".to_string(),
        },
        python_version: "3.11".to_string(),
    });
    manifest.put_workflow(Workflow::new("txt2img".to_string(), "workflows/txt2img.json".to_string()));
    manifest.nodes.put(NodeEntry::new(
        "broken-node".to_string(),
        NodeSource::Git {
            url: "https://unreachable.example/repo.git".to_string(),
            reference: None,
        },
    ));
    manifest.add_model(
        QuickHash::from("no-source-hash"),
        GlobalModelEntry {
            filename: "sd15.safetensors".to_string(),
            size: 100,
            relative_path: "checkpoints/sd15.safetensors".to_string(),
            category: Category::from("checkpoints"),
            source_urls: Vec::new(),
        },
    );

    let environment_dir = config_dir.path().join("environment");
    let cache_dir = tempfile::tempdir().unwrap();
    let index_path = cache_dir.path().join("index.json");
    let index = ModelIndex::load_or_default(&index_path).unwrap();
    let mut downloader =
        Downloader::new(cache_dir.path().to_path_buf(), Credentials::default()).unwrap();

    let git = FakeGit;
    let installer = FakeInstaller;
    let mut ctx = FinalizeContext {
        config_dir: config_dir.path(),
        environment_dir: &environment_dir,
        cache_dir: cache_dir.path(),
        strategy: comfydock_core::infrastructure::ModelStrategy::All,
        git: &git,
        installer: &installer,
        index: &index,
        downloader: &mut downloader,
    };

    let mut phases = Vec::new();
    let result = finalize(&mut manifest, &mut ctx, |phase| phases.push(phase), |_| {}).unwrap();

    assert_eq!(phases, vec![
        Phase::CloneComfyUi,
        Phase::InstallDeps,
        Phase::CopyWorkflows,
        Phase::SyncNodes,
        Phase::ResolveModels,
        Phase::Done,
    ]);
    assert_eq!(result.nodes_failed.len(), 1);
    assert_eq!(result.nodes_failed[0].0, "broken-node");
    assert_eq!(result.workflows_copied, vec!["txt2img".to_string()]);
    assert!(result.models_skipped.contains(&QuickHash::from("no-source-hash")));
    assert!(result.dependencies_failed.is_none());
    assert!(environment_dir.join("ComfyUI").is_dir());
}
