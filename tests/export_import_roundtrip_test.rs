//! Scenario: exporting an environment's configuration directory into an
//! archive and importing it elsewhere reproduces the same workflow
//! bindings and development node sources (`spec.md` §4.G, §4.H, §6.6).

use comfydock_core::domain::{Category, ComfyUiVersion, EnvironmentMeta, Workflow};
use comfydock_core::domain::{GlobalModelEntry, ModelReference};
use comfydock_core::infrastructure::{export, import, ExportSources, FileManifestStore, ManifestStore};
use comfydock_core::QuickHash;

#[test]
fn export_then_import_preserves_workflow_bindings_and_dev_node_sources() {
    let config_dir = tempfile::tempdir().unwrap();
    let manifest_path = config_dir.path().join("pyproject.toml");
    let mut store = FileManifestStore::new(
        manifest_path.clone(),
        EnvironmentMeta {
            comfyui_version: ComfyUiVersion::Release {
                comfyui_version: "v0.3.0".to_string(),
            },
            python_version: "3.11".to_string(),
        },
    );

    store.manifest_mut().add_model(
        QuickHash::from("dreamshaper-hash"),
        GlobalModelEntry {
            filename: "dreamshaper_8.safetensors".to_string(),
            size: 2_000_000_000,
            relative_path: "checkpoints/dreamshaper_8.safetensors".to_string(),
            category: Category::from("checkpoints"),
            source_urls: Vec::new(),
        },
    );

    let mut checkpoint_ref = ModelReference::unresolved(
        "4".to_string(),
        "CheckpointLoaderSimple".to_string(),
        0,
        "dreamshaper_8.safetensors".to_string(),
        Category::from("checkpoints"),
    );
    checkpoint_ref.mark_resolved(QuickHash::from("dreamshaper-hash"));
    let mut txt2img = Workflow::new("txt2img".to_string(), "workflows/txt2img.json".to_string());
    txt2img.references.push(checkpoint_ref);
    store.manifest_mut().put_workflow(txt2img);

    let upscale = Workflow::new("upscale".to_string(), "workflows/upscale.json".to_string());
    store.manifest_mut().put_workflow(upscale);

    store.save().unwrap();

    std::fs::create_dir_all(config_dir.path().join("workflows")).unwrap();
    let txt2img_json = serde_json::json!({ "nodes": [] }).to_string();
    let upscale_json = serde_json::json!({ "nodes": [] }).to_string();
    std::fs::write(config_dir.path().join("workflows/txt2img.json"), &txt2img_json).unwrap();
    std::fs::write(config_dir.path().join("workflows/upscale.json"), &upscale_json).unwrap();

    let dev_node_dir = tempfile::tempdir().unwrap();
    std::fs::write(dev_node_dir.path().join("main.py"), b"print('custom node')").unwrap();

    let persistent_manifest_toml = std::fs::read(&manifest_path).unwrap();
    let sources = ExportSources {
        manifest_json: b"{}",
        persistent_manifest_toml: &persistent_manifest_toml,
        workflows: vec![
            ("txt2img.json".to_string(), txt2img_json.into_bytes()),
            ("upscale.json".to_string(), upscale_json.into_bytes()),
        ],
        dev_node_dirs: vec![("my_node".to_string(), dev_node_dir.path().to_path_buf())],
    };

    let archive_path = config_dir.path().join("export.tar.gz");
    export(&sources, &archive_path).unwrap();

    let extracted = config_dir.path().join("extracted");
    import(&archive_path, &extracted).unwrap();

    assert!(extracted.join("workflows/txt2img.json").exists());
    assert!(extracted.join("workflows/upscale.json").exists());
    assert_eq!(
        std::fs::read(extracted.join("dev_nodes/my_node/main.py")).unwrap(),
        b"print('custom node')"
    );

    let reloaded = FileManifestStore::load(&extracted.join("pyproject.toml")).unwrap();
    let reloaded_txt2img = reloaded.manifest().get_workflow("txt2img").unwrap();
    assert_eq!(reloaded_txt2img.references.len(), 1);
    assert_eq!(reloaded_txt2img.references[0].node_id, "4");
    assert_eq!(
        reloaded_txt2img.references[0].hash,
        Some(QuickHash::from("dreamshaper-hash"))
    );
    assert!(reloaded.manifest().get_workflow("upscale").is_some());
    assert!(reloaded
        .manifest()
        .get_model(&QuickHash::from("dreamshaper-hash"))
        .is_some());
}
