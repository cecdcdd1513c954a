//! The model index: a workspace-wide content-addressed catalog of model
//! files, persisted as JSON (`spec.md` §4.B). Backed by the hasher for
//! identity and by `walkdir` for incremental scanning.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::model::{Location, Model, Source};
use crate::domain::resolution::{ModelCandidate, ModelLookup};
use crate::hash::{self, HashError, QuickHash, StrongDigestRequest};

/// Errors raised scanning or persisting the model index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to read index file: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse index file: {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write index file: {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to hash {}", path.display())]
    Hash {
        path: PathBuf,
        #[source]
        source: HashError,
    },
}

/// One scan's worth of bookkeeping: what changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub added: usize,
    pub updated: usize,
    pub pruned: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PersistedLocation {
    relative_path: String,
    filename: String,
    mtime: i64,
    last_seen: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PersistedSource {
    source_type: crate::domain::model::SourceType,
    url: String,
    metadata: HashMap<String, String>,
    added_at: OffsetDateTime,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct PersistedModel {
    size: u64,
    sha256: Option<String>,
    blake3: Option<String>,
    indexed_at: OffsetDateTime,
    locations: Vec<PersistedLocation>,
    sources: Vec<PersistedSource>,
}

/// The on-disk index: a JSON object keyed by quick-hash
/// (`spec.md` §4.B's relational view, realized as one file-backed table
/// rather than SQL — see `DESIGN.md`).
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct IndexDocument {
    #[serde(default)]
    models: HashMap<String, PersistedModel>,
}

/// Single-writer, concurrent-reader model index over a models root
/// directory (`spec.md` §4.B "Concurrency").
pub struct ModelIndex {
    path: PathBuf,
    models: Mutex<HashMap<QuickHash, Model>>,
}

impl ModelIndex {
    /// Load an existing index, or start empty if the file doesn't exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self, IndexError> {
        if !path.exists() {
            return Ok(Self {
                path: path.to_path_buf(),
                models: Mutex::new(HashMap::new()),
            });
        }
        let content = fs::read_to_string(path).map_err(|source| IndexError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let document: IndexDocument =
            serde_json::from_str(&content).map_err(|source| IndexError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let models = document
            .models
            .into_iter()
            .map(|(hash, persisted)| {
                let hash = QuickHash::from(hash);
                (hash.clone(), from_persisted(hash, persisted))
            })
            .collect();
        Ok(Self {
            path: path.to_path_buf(),
            models: Mutex::new(models),
        })
    }

    /// Persist the current in-memory state to `self.path`, atomically.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Write`] if the temp-write-rename sequence fails.
    pub fn save(&self) -> Result<(), IndexError> {
        let models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let document = IndexDocument {
            models: models
                .iter()
                .map(|(hash, model)| (hash.as_str().to_string(), to_persisted(model)))
                .collect(),
        };
        let serialized = serde_json::to_string_pretty(&document).map_err(|source| {
            IndexError::Parse {
                path: self.path.clone(),
                source,
            }
        })?;

        let mut temp_name = self.path.file_name().unwrap_or_default().to_os_string();
        temp_name.push(".tmp");
        let temp_path = self.path.with_file_name(temp_name);
        let mut file = fs::File::create(&temp_path).map_err(|source| IndexError::Write {
            path: self.path.clone(),
            source,
        })?;
        file.write_all(serialized.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|source| IndexError::Write {
                path: self.path.clone(),
                source,
            })?;
        drop(file);
        fs::rename(&temp_path, &self.path).map_err(|source| IndexError::Write {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }

    #[must_use]
    pub fn has_model(&self, hash: &QuickHash) -> bool {
        self.models
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(hash)
    }

    #[must_use]
    pub fn get_model(&self, hash: &QuickHash) -> Option<Model> {
        self.models
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(hash)
            .cloned()
    }

    /// Case-insensitive substring match over location filenames
    /// (`spec.md` §4.B).
    #[must_use]
    pub fn find_by_filename(&self, name: &str, limit: usize) -> Vec<(Model, Location)> {
        let needle = name.to_lowercase();
        let models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut hits = Vec::new();
        for model in models.values() {
            for location in model.locations() {
                if location.filename.to_lowercase().contains(&needle) {
                    hits.push((model.clone(), location.clone()));
                    if hits.len() >= limit {
                        return hits;
                    }
                }
            }
        }
        hits
    }

    fn find_by_relative_path_inner(&self, relative_path: &str) -> Vec<(Model, Location)> {
        let models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        models
            .values()
            .flat_map(|model| {
                model
                    .locations()
                    .iter()
                    .filter(|l| l.relative_path == relative_path)
                    .map(move |l| (model.clone(), l.clone()))
            })
            .collect()
    }

    /// Locations whose `relative_path`'s first segment matches `category`
    /// and whose filename matches `name` exactly (`spec.md` §4.B, §6.4).
    fn find_in_category_inner(&self, name: &str, category: &str) -> Vec<(Model, Location)> {
        let models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        models
            .values()
            .flat_map(|model| {
                model
                    .locations()
                    .iter()
                    .filter(|l| {
                        l.filename == name
                            && l.relative_path
                                .split('/')
                                .next()
                                .is_some_and(|segment| segment == category)
                    })
                    .map(move |l| (model.clone(), l.clone()))
            })
            .collect()
    }

    /// Hash and register (or refresh) a single file's location
    /// (`spec.md` §4.B `add_or_update_location`).
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Hash`] if the file cannot be read.
    pub fn add_or_update_location(
        &self,
        abs_path: &Path,
        relative_path: &str,
    ) -> Result<QuickHash, IndexError> {
        let result = hash::quick_hash_file(abs_path).map_err(|source| IndexError::Hash {
            path: abs_path.to_path_buf(),
            source,
        })?;
        let mtime = file_mtime(abs_path);
        let filename = abs_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let model = models
            .entry(result.hash.clone())
            .or_insert_with(|| Model::new(result.hash.clone(), result.size, now()));
        model.upsert_location(Location {
            relative_path: relative_path.to_string(),
            filename,
            mtime,
            last_seen: mtime,
        });
        Ok(result.hash)
    }

    /// Idempotent on `(hash, url)` (`spec.md` §4.B).
    pub fn add_source(&self, hash: &QuickHash, source: Source) {
        let mut models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(model) = models.get_mut(hash) {
            model.add_source(source);
        }
    }

    /// Walk `root_dir`, hash every changed file, and prune locations whose
    /// backing file vanished since the last scan (`spec.md` §4.B).
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Hash`] only if a file that still exists cannot
    /// be read; files that vanish mid-scan are skipped, not errored.
    pub fn scan(
        &self,
        root_dir: &Path,
        mut progress: impl FnMut(&Path),
    ) -> Result<ScanReport, IndexError> {
        let epoch = now().unix_timestamp();
        let mut report = ScanReport::default();
        let mut seen_paths = std::collections::HashSet::new();

        for entry in walkdir::WalkDir::new(root_dir)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let abs_path = entry.path();
            let Ok(relative) = abs_path.strip_prefix(root_dir) else {
                continue;
            };
            let relative_path = relative.to_string_lossy().replace('\\', "/");
            seen_paths.insert(relative_path.clone());
            progress(abs_path);

            let mtime = file_mtime(abs_path);
            let size = entry.metadata().map(|m| m.len()).unwrap_or_default();
            if !self.location_is_stale(&relative_path, mtime, size) {
                report.unchanged += 1;
                continue;
            }

            let Ok(hash) = hash::quick_hash_file(abs_path) else {
                warn!("skipping unreadable file during scan: {}", abs_path.display());
                continue;
            };
            let is_new = !self.has_location(&hash.hash, &relative_path);
            self.add_or_update_location(abs_path, &relative_path)?;
            self.touch_last_seen(&relative_path, epoch);
            if is_new {
                report.added += 1;
                debug!("indexed new model at {relative_path}");
            } else {
                report.updated += 1;
                debug!("refreshed location {relative_path}");
            }
        }

        report.pruned = self.prune_absent(&seen_paths, epoch);
        info!(
            "scan of {} complete: {} added, {} updated, {} pruned, {} unchanged",
            root_dir.display(),
            report.added,
            report.updated,
            report.pruned,
            report.unchanged
        );
        Ok(report)
    }

    fn location_is_stale(&self, relative_path: &str, mtime: i64, size: u64) -> bool {
        let models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        !models.values().any(|model| {
            model.size == size
                && model
                    .locations()
                    .iter()
                    .any(|l| l.relative_path == relative_path && l.mtime == mtime)
        })
    }

    /// Whether `relative_path` is already a tracked location for `hash`,
    /// regardless of which hash (if any) it was tracked under before —
    /// a move to a path not yet seen under this hash still counts as new.
    fn has_location(&self, hash: &QuickHash, relative_path: &str) -> bool {
        self.models
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(hash)
            .is_some_and(|model| model.locations().iter().any(|l| l.relative_path == relative_path))
    }

    fn touch_last_seen(&self, relative_path: &str, epoch: i64) {
        let mut models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for model in models.values_mut() {
            if let Some(location) = model
                .locations()
                .iter()
                .position(|l| l.relative_path == relative_path)
            {
                let mut updated = model.locations()[location].clone();
                updated.last_seen = epoch;
                model.upsert_location(updated);
            }
        }
    }

    /// Remove locations not seen in the current scan whose files are
    /// absent, and delete any model left with no locations and no sources.
    fn prune_absent(&self, seen_paths: &std::collections::HashSet<String>, _epoch: i64) -> usize {
        let mut models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut pruned = 0;
        let mut empty_hashes = Vec::new();
        for (hash, model) in models.iter_mut() {
            let stale: Vec<String> = model
                .locations()
                .iter()
                .filter(|l| !seen_paths.contains(&l.relative_path))
                .map(|l| l.relative_path.clone())
                .collect();
            for path in stale {
                if model.remove_location(&path) {
                    pruned += 1;
                }
            }
            if model.is_orphan() {
                empty_hashes.push(hash.clone());
            }
        }
        for hash in empty_hashes {
            models.remove(&hash);
        }
        pruned
    }

    /// Lazily populate SHA-256/BLAKE3 by streaming a current location of
    /// this model through the hasher (`spec.md` §4.B).
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Hash`] if no location's file is readable.
    pub fn compute_strong_digests(&self, hash: &QuickHash, root_dir: &Path) -> Result<(), IndexError> {
        let location = {
            let models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            models
                .get(hash)
                .and_then(|m| m.locations().first().cloned())
        };
        let Some(location) = location else {
            return Ok(());
        };
        let abs_path = root_dir.join(&location.relative_path);
        let mut file = fs::File::open(&abs_path).map_err(|source| IndexError::Hash {
            path: abs_path.clone(),
            source: HashError::Io {
                path: abs_path.clone(),
                source,
            },
        })?;
        let digests = hash::stream_hash(
            &mut file,
            StrongDigestRequest {
                sha256: true,
                blake3: true,
            },
        )
        .map_err(|source| IndexError::Hash {
            path: abs_path.clone(),
            source: HashError::Io {
                path: abs_path,
                source,
            },
        })?;

        let mut models = self.models.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(model) = models.get_mut(hash) {
            let _ = model.set_strong_digests(digests.sha256, digests.blake3);
        }
        Ok(())
    }
}

impl ModelLookup for ModelIndex {
    fn find_by_relative_path(&self, relative_path: &str) -> Vec<ModelCandidate> {
        self.find_by_relative_path_inner(relative_path)
            .into_iter()
            .map(|(model, location)| ModelCandidate {
                hash: model.hash,
                relative_path: location.relative_path,
                filename: location.filename,
            })
            .collect()
    }

    fn find_in_category(&self, filename: &str, category: &str) -> Vec<ModelCandidate> {
        self.find_in_category_inner(filename, category)
            .into_iter()
            .map(|(model, location)| ModelCandidate {
                hash: model.hash,
                relative_path: location.relative_path,
                filename: location.filename,
            })
            .collect()
    }

    fn still_present(&self, hash: &QuickHash) -> bool {
        self.has_model(hash)
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(
        i64::try_from(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        )
        .unwrap_or_default(),
    )
    .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

fn file_mtime(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| i64::try_from(d.as_secs()).unwrap_or_default())
        .unwrap_or_default()
}

fn to_persisted(model: &Model) -> PersistedModel {
    PersistedModel {
        size: model.size,
        sha256: model.sha256.clone(),
        blake3: model.blake3.clone(),
        indexed_at: model.indexed_at,
        locations: model
            .locations()
            .iter()
            .map(|l| PersistedLocation {
                relative_path: l.relative_path.clone(),
                filename: l.filename.clone(),
                mtime: l.mtime,
                last_seen: l.last_seen,
            })
            .collect(),
        sources: model
            .sources()
            .iter()
            .map(|s| PersistedSource {
                source_type: s.source_type,
                url: s.url.clone(),
                metadata: s.metadata.clone(),
                added_at: s.added_at,
            })
            .collect(),
    }
}

fn from_persisted(hash: QuickHash, persisted: PersistedModel) -> Model {
    let mut model = Model::new(hash, persisted.size, persisted.indexed_at);
    let _ = model.set_strong_digests(persisted.sha256, persisted.blake3);
    for location in persisted.locations {
        model.upsert_location(Location {
            relative_path: location.relative_path,
            filename: location.filename,
            mtime: location.mtime,
            last_seen: location.last_seen,
        });
    }
    for source in persisted.sources {
        model.add_source(Source {
            source_type: source.source_type,
            url: source.url,
            metadata: source.metadata,
            added_at: source.added_at,
        });
    }
    model
}
