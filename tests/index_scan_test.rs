//! Scenario: indexing a directory is idempotent, and moving a file updates
//! locations under the same hash rather than creating a second model entry.

use std::fs;

use comfydock_core::domain::ModelLookup;
use comfydock_core::infrastructure::ModelIndex;

#[test]
fn scanning_twice_with_no_changes_reports_nothing_new() {
    let models_root = tempfile::tempdir().unwrap();
    fs::create_dir_all(models_root.path().join("checkpoints")).unwrap();
    fs::create_dir_all(models_root.path().join("loras")).unwrap();
    fs::write(
        models_root.path().join("checkpoints/a.safetensors"),
        vec![1u8; 1024],
    )
    .unwrap();
    fs::write(models_root.path().join("loras/b.safetensors"), vec![2u8; 512]).unwrap();

    let index_path = tempfile::tempdir().unwrap().path().join("index.json");
    let index = ModelIndex::load_or_default(&index_path).unwrap();

    let first = index.scan(models_root.path(), |_| {}).unwrap();
    assert_eq!(first.added, 2);
    assert_eq!(first.updated, 0);

    let second = index.scan(models_root.path(), |_| {}).unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 2);
}

#[test]
fn moving_a_file_prunes_the_old_location_and_keeps_the_hash() {
    let models_root = tempfile::tempdir().unwrap();
    let checkpoints = models_root.path().join("checkpoints");
    fs::create_dir_all(&checkpoints).unwrap();
    fs::write(checkpoints.join("a.safetensors"), vec![9u8; 2048]).unwrap();

    let index_path = tempfile::tempdir().unwrap().path().join("index.json");
    let index = ModelIndex::load_or_default(&index_path).unwrap();
    index.scan(models_root.path(), |_| {}).unwrap();

    let archive_dir = checkpoints.join("archive");
    fs::create_dir_all(&archive_dir).unwrap();
    fs::rename(checkpoints.join("a.safetensors"), archive_dir.join("a.safetensors")).unwrap();

    let report = index.scan(models_root.path(), |_| {}).unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.pruned, 1);

    let hash = index
        .find_in_category("a.safetensors", "checkpoints")
        .into_iter()
        .next()
        .expect("the moved file is still findable by category")
        .hash;
    assert!(index.has_model(&hash));
}
