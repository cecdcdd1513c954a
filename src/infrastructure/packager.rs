//! Builds and extracts the environment export archive: a gzip-compressed
//! tar with a fixed layout (`spec.md` §4.G, §6.6).

use std::fs;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

const DEV_NODE_SIZE_LIMIT_BYTES: u64 = 200 * 1024 * 1024;
const IGNORE_FILE_NAME: &str = ".comfydock_ignore";
const DEFAULT_IGNORES: &[&str] = &[".git", "__pycache__", "*.pyc"];

/// Errors raised building or extracting an archive.
#[derive(Debug, Error)]
pub enum PackagerError {
    #[error("manifest has uncommitted workflows; commit or pass allow_issues")]
    DirtyManifest,

    #[error("workflow '{0}' has {1} unresolved required/flexible reference(s); pass allow_issues")]
    UnresolvedReferences(String, usize),

    #[error("development node '{name}' exceeds the {} MiB size limit after filtering", DEV_NODE_SIZE_LIMIT_BYTES / 1024 / 1024)]
    DevNodeTooLarge { name: String },

    #[error("archive entry escapes the archive root: {0}")]
    PathTraversal(String),

    #[error("archive entry is a symlink escaping the archive root: {0}")]
    UnsafeSymlink(String),

    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source material the exporter assembles into an archive
/// (`spec.md` §4.G step 3).
pub struct ExportSources<'a> {
    pub manifest_json: &'a [u8],
    pub persistent_manifest_toml: &'a [u8],
    /// `(workflow file name, JSON bytes)`.
    pub workflows: Vec<(String, Vec<u8>)>,
    /// `(node name, absolute path to its directory)`, for development nodes.
    pub dev_node_dirs: Vec<(String, PathBuf)>,
}

/// Whether the manifest is safe to export as-is (`spec.md` §4.G step 1).
pub struct ExportPreflight {
    pub manifest_dirty: bool,
    /// `(workflow name, count of unresolved required/flexible references)`.
    pub blocking_workflows: Vec<(String, usize)>,
}

impl ExportPreflight {
    /// # Errors
    ///
    /// Returns the first blocking condition found, unless `allow_issues`.
    pub fn check(&self, allow_issues: bool) -> Result<(), PackagerError> {
        if allow_issues {
            return Ok(());
        }
        if self.manifest_dirty {
            return Err(PackagerError::DirtyManifest);
        }
        if let Some((name, count)) = self.blocking_workflows.first() {
            return Err(PackagerError::UnresolvedReferences(name.clone(), *count));
        }
        Ok(())
    }
}

/// Build the gzip-compressed tar archive at `output_path` from `sources`.
///
/// # Errors
///
/// Returns [`PackagerError::DevNodeTooLarge`] if a development node exceeds
/// the size guard after ignore-list filtering, or an I/O error.
pub fn export(
    sources: &ExportSources<'_>,
    output_path: &Path,
) -> Result<(), PackagerError> {
    let file = fs::File::create(output_path).map_err(|source| PackagerError::Write {
        path: output_path.to_path_buf(),
        source,
    })?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    append_bytes(&mut builder, "manifest.json", sources.manifest_json)?;
    append_bytes(&mut builder, "pyproject.toml", sources.persistent_manifest_toml)?;
    for (name, bytes) in &sources.workflows {
        append_bytes(&mut builder, &format!("workflows/{name}"), bytes)?;
    }
    for (name, dir) in &sources.dev_node_dirs {
        append_dev_node(&mut builder, name, dir)?;
    }

    builder
        .into_inner()
        .and_then(flate2::write::GzEncoder::finish)
        .map_err(|source| PackagerError::Write {
            path: output_path.to_path_buf(),
            source,
        })?;
    Ok(())
}

fn append_bytes(
    builder: &mut tar::Builder<GzEncoder<fs::File>>,
    archive_path: &str,
    bytes: &[u8],
) -> Result<(), PackagerError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, archive_path, bytes)
        .map_err(|source| PackagerError::Write {
            path: PathBuf::from(archive_path),
            source,
        })
}

fn append_dev_node(
    builder: &mut tar::Builder<GzEncoder<fs::File>>,
    name: &str,
    dir: &Path,
) -> Result<(), PackagerError> {
    let ignores = load_ignore_patterns(dir)?;
    let mut total_size = 0u64;
    let mut files = Vec::new();

    for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        if is_ignored(relative, &ignores) {
            continue;
        }
        let size = entry.metadata().map(|m| m.len()).unwrap_or_default();
        total_size += size;
        files.push((relative.to_path_buf(), entry.path().to_path_buf()));
    }

    if exceeds_size_limit(total_size, DEV_NODE_SIZE_LIMIT_BYTES) {
        return Err(PackagerError::DevNodeTooLarge {
            name: name.to_string(),
        });
    }

    for (relative, absolute) in files {
        let archive_path = format!("dev_nodes/{name}/{}", relative.to_string_lossy());
        let mut file = fs::File::open(&absolute).map_err(|source| PackagerError::Read {
            path: absolute.clone(),
            source,
        })?;
        builder
            .append_file(&archive_path, &mut file)
            .map_err(|source| PackagerError::Write {
                path: PathBuf::from(archive_path),
                source,
            })?;
    }
    Ok(())
}

fn exceeds_size_limit(total_size: u64, limit: u64) -> bool {
    total_size > limit
}

fn load_ignore_patterns(dir: &Path) -> Result<Vec<glob::Pattern>, PackagerError> {
    let mut patterns: Vec<glob::Pattern> = DEFAULT_IGNORES
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();
    let ignore_file = dir.join(IGNORE_FILE_NAME);
    if ignore_file.exists() {
        let content = fs::read_to_string(&ignore_file).map_err(|source| PackagerError::Read {
            path: ignore_file,
            source,
        })?;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Ok(pattern) = glob::Pattern::new(line) {
                patterns.push(pattern);
            }
        }
    }
    Ok(patterns)
}

fn is_ignored(relative: &Path, patterns: &[glob::Pattern]) -> bool {
    let path_str = relative.to_string_lossy();
    patterns.iter().any(|p| {
        p.matches(&path_str)
            || relative
                .components()
                .any(|c| p.matches(&c.as_os_str().to_string_lossy()))
    })
}

/// Extract an archive into `target_dir`, which must not already exist.
///
/// Refuses entries containing `..`, absolute paths, or symlinks that would
/// resolve outside `target_dir` (`spec.md` §9 "Archive safety").
///
/// # Errors
///
/// Returns [`PackagerError::PathTraversal`] or [`PackagerError::UnsafeSymlink`]
/// on an unsafe entry, or an I/O error.
pub fn import(archive_path: &Path, target_dir: &Path) -> Result<(), PackagerError> {
    let file = fs::File::open(archive_path).map_err(|source| PackagerError::Read {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);

    fs::create_dir_all(target_dir).map_err(|source| PackagerError::Write {
        path: target_dir.to_path_buf(),
        source,
    })?;

    for entry in archive
        .entries()
        .map_err(|source| PackagerError::Read {
            path: archive_path.to_path_buf(),
            source,
        })?
    {
        let mut entry = entry.map_err(|source| PackagerError::Read {
            path: archive_path.to_path_buf(),
            source,
        })?;
        let entry_path = entry
            .path()
            .map_err(|source| PackagerError::Read {
                path: archive_path.to_path_buf(),
                source,
            })?
            .into_owned();
        validate_entry_path(&entry_path)?;

        if entry.header().entry_type().is_symlink() {
            let link_name = entry
                .link_name()
                .ok()
                .flatten()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            return Err(PackagerError::UnsafeSymlink(link_name));
        }

        let dest = target_dir.join(&entry_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|source| PackagerError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        entry.unpack(&dest).map_err(|source| PackagerError::Write {
            path: dest,
            source,
        })?;
    }

    Ok(())
}

fn validate_entry_path(path: &Path) -> Result<(), PackagerError> {
    if path.is_absolute() {
        return Err(PackagerError::PathTraversal(path.display().to_string()));
    }
    if path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(PackagerError::PathTraversal(path.display().to_string()));
    }
    Ok(())
}
