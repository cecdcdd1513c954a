//! Atomic persistence for the environment manifest (`spec.md` §4.C, §6.1).
//!
//! The on-disk form is a `pyproject.toml`-shaped document: unrelated tables
//! (e.g. a real `[project]` section) are left untouched, only the
//! `tool.comfydock.*` tables are rewritten, via `toml_edit` so the rest of
//! the file survives byte-for-byte.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;
use toml_edit::{Array, DocumentMut, Item, Table, value};

use crate::domain::manifest::{ComfyUiVersion, EnvironmentMeta, GlobalModelEntry, ManifestError};
use crate::domain::workflow::{Criticality, ModelReference, ReferenceStatus, Workflow};
use crate::domain::{Category, Manifest};
use crate::hash::QuickHash;

/// Errors raised loading or saving the persistent manifest document.
#[derive(Debug, Error)]
pub enum ManifestStoreError {
    #[error("failed to read manifest file: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest file: {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml_edit::TomlError>,
    },

    #[error("failed to write manifest file: {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("manifest violates a structural invariant")]
    Invariant(#[from] ManifestError),

    #[error("malformed 'tool.comfydock.{section}' table")]
    MalformedSection { section: &'static str },
}

/// Trait covering the operations the resolver and finalizer need from a
/// persisted manifest (`spec.md` §4.C).
pub trait ManifestStore {
    /// # Errors
    ///
    /// Returns [`ManifestStoreError::Invariant`] if validation fails, or a
    /// write error if the temp-file-rename sequence cannot complete.
    fn save(&mut self) -> Result<(), ManifestStoreError>;
    fn manifest(&self) -> &Manifest;
    fn manifest_mut(&mut self) -> &mut Manifest;
}

/// A manifest store backed by a file on disk, persisted atomically
/// (write-to-temp, fsync, rename).
pub struct FileManifestStore {
    path: PathBuf,
    manifest: Manifest,
}

impl FileManifestStore {
    /// Load an existing manifest document from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// `tool.comfydock` table is malformed.
    pub fn load(path: &Path) -> Result<Self, ManifestStoreError> {
        let content = fs::read_to_string(path).map_err(|source| ManifestStoreError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let document: DocumentMut =
            content
                .parse()
                .map_err(|source| ManifestStoreError::Parse {
                    path: path.to_path_buf(),
                    source: Box::new(source),
                })?;
        let manifest = format::parse(&document)?;
        Ok(Self {
            path: path.to_path_buf(),
            manifest,
        })
    }

    /// Start a fresh, empty manifest backed by `path` (no file is written
    /// until [`FileManifestStore::save`] is called).
    #[must_use]
    pub fn new(path: PathBuf, meta: EnvironmentMeta) -> Self {
        Self {
            path,
            manifest: Manifest::new(meta),
        }
    }

    fn save_to_disk(&self) -> Result<(), ManifestStoreError> {
        let mut document = match fs::read_to_string(&self.path) {
            Ok(content) => content
                .parse()
                .map_err(|source| ManifestStoreError::Parse {
                    path: self.path.clone(),
                    source: Box::new(source),
                })?,
            Err(_) => DocumentMut::new(),
        };
        format::write(&mut document, &self.manifest);

        let serialized = document.to_string();
        let temp_path = temp_path_for(&self.path);
        write_atomically(&temp_path, &self.path, serialized.as_bytes()).map_err(|source| {
            ManifestStoreError::Write {
                path: self.path.clone(),
                source,
            }
        })?;

        info!("manifest updated: {}", self.path.display());
        Ok(())
    }
}

/// The sibling temp-file path a write lands in before the atomic rename,
/// matching the downloader's `<target>.tmp` convention.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` to `temp_path`, fsync, then rename over `final_path`.
/// Atomic with respect to crashes (`spec.md` §4.C).
fn write_atomically(temp_path: &Path, final_path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp_path, final_path)
}

impl ManifestStore for FileManifestStore {
    fn save(&mut self) -> Result<(), ManifestStoreError> {
        self.manifest.validate()?;
        self.save_to_disk()
    }

    fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }
}

/// An in-memory manifest store, for resolver/finalizer tests that don't
/// need real file I/O.
pub struct MemoryManifestStore {
    manifest: Manifest,
}

impl MemoryManifestStore {
    #[must_use]
    pub fn new(manifest: Manifest) -> Self {
        Self { manifest }
    }
}

impl ManifestStore for MemoryManifestStore {
    fn save(&mut self) -> Result<(), ManifestStoreError> {
        self.manifest.validate()?;
        Ok(())
    }

    fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    fn manifest_mut(&mut self) -> &mut Manifest {
        &mut self.manifest
    }
}

/// Conversion between the domain `Manifest` and the `tool.comfydock.*`
/// `pyproject.toml`-shaped tables (`spec.md` §6.1).
mod format {
    use super::{
        Array, Category, ComfyUiVersion, Criticality, DocumentMut, EnvironmentMeta,
        GlobalModelEntry, Item, Manifest, ManifestStoreError, ModelReference, QuickHash,
        ReferenceStatus, Table, Workflow, value,
    };

    fn comfydock_table(document: &DocumentMut) -> Option<&Table> {
        document.get("tool")?.as_table()?.get("comfydock")?.as_table()
    }

    pub(super) fn parse(document: &DocumentMut) -> Result<Manifest, ManifestStoreError> {
        let Some(comfydock) = comfydock_table(document) else {
            return Ok(Manifest::new(EnvironmentMeta {
                comfyui_version: ComfyUiVersion::Branch {
                    comfyui_version: "master".to_string(),
                },
                python_version: String::new(),
            }));
        };

        let environment = comfydock
            .get("environment")
            .and_then(Item::as_table)
            .ok_or(ManifestStoreError::MalformedSection {
                section: "environment",
            })?;
        let version_type = environment
            .get("comfyui_version_type")
            .and_then(Item::as_str)
            .unwrap_or("branch");
        let version_value = environment
            .get("comfyui_version")
            .and_then(Item::as_str)
            .unwrap_or_default()
            .to_string();
        let comfyui_version = match version_type {
            "release" => ComfyUiVersion::Release {
                comfyui_version: version_value,
            },
            "commit" => ComfyUiVersion::Commit {
                comfyui_version: version_value,
            },
            _ => ComfyUiVersion::Branch {
                comfyui_version: version_value,
            },
        };
        let python_version = environment
            .get("python_version")
            .and_then(Item::as_str)
            .unwrap_or_default()
            .to_string();

        let mut manifest = Manifest::new(EnvironmentMeta {
            comfyui_version,
            python_version,
        });

        if let Some(models) = comfydock.get("models").and_then(Item::as_table) {
            for (hash, entry) in models {
                let Some(entry) = entry.as_table() else {
                    continue;
                };
                let filename = entry
                    .get("filename")
                    .and_then(Item::as_str)
                    .unwrap_or_default()
                    .to_string();
                let size = entry
                    .get("size")
                    .and_then(Item::as_integer)
                    .unwrap_or_default();
                let relative_path = entry
                    .get("relative_path")
                    .and_then(Item::as_str)
                    .unwrap_or_default()
                    .to_string();
                let category = entry
                    .get("category")
                    .and_then(Item::as_str)
                    .unwrap_or("unknown")
                    .to_string();
                let source_urls = entry
                    .get("sources")
                    .and_then(Item::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default();
                manifest.add_model(
                    QuickHash::from(hash),
                    GlobalModelEntry {
                        filename,
                        size: u64::try_from(size).unwrap_or_default(),
                        relative_path,
                        category: Category::from(category.as_str()),
                        source_urls,
                    },
                );
            }
        }

        if let Some(workflows) = comfydock.get("workflows").and_then(Item::as_table) {
            for (name, entry) in workflows {
                let Some(entry) = entry.as_table() else {
                    continue;
                };
                let path = entry
                    .get("path")
                    .and_then(Item::as_str)
                    .unwrap_or_default()
                    .to_string();
                let mut workflow = Workflow::new(name.to_string(), path);
                if let Some(refs) = entry.get("models").and_then(Item::as_array_of_tables) {
                    for r in refs {
                        if let Some(reference) = parse_reference(r) {
                            workflow.references.push(reference);
                        }
                    }
                }
                manifest.put_workflow(workflow);
            }
        }

        Ok(manifest)
    }

    fn parse_reference(table: &Table) -> Option<ModelReference> {
        let node_id = table.get("node_id")?.as_str()?.to_string();
        let node_type = table.get("node_type")?.as_str()?.to_string();
        let widget_index = usize::try_from(table.get("widget_index")?.as_integer()?).ok()?;
        let widget_value = table.get("widget_value")?.as_str()?.to_string();
        let category = Category::from(table.get("category")?.as_str()?);
        let criticality = match table.get("criticality").and_then(Item::as_str) {
            Some("flexible") => Criticality::Flexible,
            Some("optional") => Criticality::Optional,
            _ => Criticality::Required,
        };
        let status = match table.get("status").and_then(Item::as_str) {
            Some("resolved") => ReferenceStatus::Resolved,
            _ => ReferenceStatus::Unresolved,
        };
        let hash = table
            .get("hash")
            .and_then(Item::as_str)
            .map(QuickHash::from);

        Some(ModelReference {
            node_id,
            node_type,
            widget_index,
            widget_value,
            criticality,
            category,
            status,
            hash,
        })
    }

    pub(super) fn write(document: &mut DocumentMut, manifest: &Manifest) {
        let tool = document
            .entry("tool")
            .or_insert_with(|| Item::Table(Table::new()));
        let tool = tool.as_table_mut().expect("'tool' is always a table here");
        let comfydock = tool
            .entry("comfydock")
            .or_insert_with(|| Item::Table(Table::new()));
        let comfydock = comfydock
            .as_table_mut()
            .expect("'tool.comfydock' is always a table here");

        let mut environment = Table::new();
        let (version_type, version_value) = match &manifest.meta.comfyui_version {
            super::ComfyUiVersion::Release { comfyui_version } => ("release", comfyui_version),
            super::ComfyUiVersion::Branch { comfyui_version } => ("branch", comfyui_version),
            super::ComfyUiVersion::Commit { comfyui_version } => ("commit", comfyui_version),
        };
        environment["comfyui_version"] = value(version_value.as_str());
        environment["comfyui_version_type"] = value(version_type);
        environment["python_version"] = value(manifest.meta.python_version.as_str());
        comfydock["environment"] = Item::Table(environment);

        let mut models = Table::new();
        for (hash, entry) in manifest.all_models() {
            let mut row = Table::new();
            row["filename"] = value(entry.filename.as_str());
            row["size"] = value(i64::try_from(entry.size).unwrap_or(i64::MAX));
            row["relative_path"] = value(entry.relative_path.as_str());
            row["category"] = value(entry.category.as_str());
            let mut sources = Array::new();
            for url in &entry.source_urls {
                sources.push(url.as_str());
            }
            row["sources"] = value(sources);
            models[hash.as_str()] = Item::Table(row);
        }
        comfydock["models"] = Item::Table(models);

        let mut workflows = Table::new();
        for workflow in manifest.workflows() {
            let mut entry = Table::new();
            entry["path"] = value(workflow.path.as_str());
            let mut refs = toml_edit::ArrayOfTables::new();
            for reference in &workflow.references {
                refs.push(reference_table(reference));
            }
            entry["models"] = Item::ArrayOfTables(refs);
            workflows[workflow.name.as_str()] = Item::Table(entry);
        }
        comfydock["workflows"] = Item::Table(workflows);
    }

    fn reference_table(reference: &ModelReference) -> Table {
        let mut row = Table::new();
        row["node_id"] = value(reference.node_id.as_str());
        row["node_type"] = value(reference.node_type.as_str());
        row["widget_index"] = value(i64::try_from(reference.widget_index).unwrap_or(i64::MAX));
        row["widget_value"] = value(reference.widget_value.as_str());
        row["category"] = value(reference.category.as_str());
        row["criticality"] = value(match reference.criticality {
            Criticality::Required => "required",
            Criticality::Flexible => "flexible",
            Criticality::Optional => "optional",
        });
        row["status"] = value(match reference.status {
            ReferenceStatus::Resolved => "resolved",
            ReferenceStatus::Unresolved => "unresolved",
        });
        if let Some(hash) = &reference.hash {
            row["hash"] = value(hash.as_str());
        }
        row
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

    #[test]
    fn save_then_load_round_trips_workflows_and_models() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environment.toml");
        let mut store = FileManifestStore::new(path.clone(), meta());

        let mut reference = ModelReference::unresolved(
            "1".to_string(),
            "CheckpointLoaderSimple".to_string(),
            0,
            "dreamshaper_8.safetensors".to_string(),
            Category::from("checkpoints"),
        );
        reference.mark_resolved(QuickHash::from("abc123"));
        store.manifest_mut().add_model(
            QuickHash::from("abc123"),
            GlobalModelEntry {
                filename: "dreamshaper_8.safetensors".to_string(),
                size: 100,
                relative_path: "checkpoints/dreamshaper_8.safetensors".to_string(),
                category: Category::from("checkpoints"),
                source_urls: Vec::new(),
            },
        );
        let mut workflow = Workflow::new("txt2img".to_string(), "workflows/txt2img.json".to_string());
        workflow.references.push(reference);
        store.manifest_mut().put_workflow(workflow);

        store.save().unwrap();

        let loaded = FileManifestStore::load(&path).unwrap();
        assert_eq!(loaded.manifest().meta, meta());
        let workflow = loaded.manifest().get_workflow("txt2img").unwrap();
        assert_eq!(workflow.references.len(), 1);
        assert_eq!(
            workflow.references[0].hash,
            Some(QuickHash::from("abc123"))
        );
        assert!(loaded.manifest().get_model(&QuickHash::from("abc123")).is_some());
    }

    #[test]
    fn save_preserves_unrelated_toml_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environment.toml");
        fs::write(&path, "[project]\nname = \"my-env\"\n").unwrap();

        let mut store = FileManifestStore::load(&path).unwrap();
        store.save().unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[project]"));
        assert!(content.contains("name = \"my-env\""));
    }

    #[test]
    fn save_rejects_a_dangling_resolved_reference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("environment.toml");
        let mut store = FileManifestStore::new(path, meta());

        let mut reference = ModelReference::unresolved(
            "1".to_string(),
            "CheckpointLoaderSimple".to_string(),
            0,
            "x.safetensors".to_string(),
            Category::from("checkpoints"),
        );
        reference.mark_resolved(QuickHash::from("missing"));
        let mut workflow = Workflow::new("w".to_string(), "workflows/w.json".to_string());
        workflow.references.push(reference);
        store.manifest_mut().put_workflow(workflow);

        assert!(matches!(
            store.save(),
            Err(ManifestStoreError::Invariant(_))
        ));
    }
}
