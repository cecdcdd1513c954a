//! Streams model downloads with inline hashing and atomic rename
//! (`spec.md` §4.F). Built on `reqwest::blocking`, matching the HTTP client
//! style already used for remote lookups elsewhere in this codebase.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{info, warn};
use thiserror::Error;

use crate::domain::model::SourceType;
use crate::domain::resolution::{DownloadExecutor, DownloadOutcome, DownloadRequest};
use crate::hash::QuickHash;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_REDIRECTS: usize = 10;
const MAX_RETRIES: u32 = 3;
const BACKOFF_SCHEDULE: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_secs(1),
    Duration::from_secs(4),
];
const PROGRESS_THROTTLE: Duration = Duration::from_millis(250);
const READ_CHUNK_BYTES: usize = 1024 * 1024;

/// A cancellation flag shared between a caller and an in-flight download
/// (`spec.md` §5 "Cancellation").
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bearer token credentials for a download, supplied per request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub civitai_token: Option<String>,
    pub huggingface_token: Option<String>,
}

/// A full download request (`spec.md` §4.F).
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub target_relative_path: String,
    pub expected_size: Option<u64>,
    pub expected_hash: Option<QuickHash>,
}

/// Final result of a successful download.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub final_path: PathBuf,
    pub quick_hash: QuickHash,
    pub sha256: Option<String>,
    pub blake3: String,
    pub bytes: u64,
}

/// The taxonomy from `spec.md` §4.F "Failure modes and taxonomy".
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("authentication required for {host}")]
    AuthenticationRequired { host: String },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("disk full while writing {}", path.display())]
    DiskFull { path: PathBuf },

    #[error("transport error after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("download canceled")]
    Canceled,

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("failed to prepare target {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Streams downloads to a models root, serializing writes per target
/// (`spec.md` §4.F "Concurrency").
pub struct Downloader {
    client: reqwest::blocking::Client,
    models_root: PathBuf,
    credentials: Credentials,
    target_locks: Mutex<std::collections::HashSet<String>>,
}

impl Downloader {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(models_root: PathBuf, credentials: Credentials) -> reqwest::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_IDLE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self {
            client,
            models_root,
            credentials,
            target_locks: Mutex::new(std::collections::HashSet::new()),
        })
    }

    fn bearer_token(&self, url: &str) -> Option<&str> {
        match SourceType::classify(url) {
            SourceType::Civitai => self.credentials.civitai_token.as_deref(),
            SourceType::HuggingFace => self.credentials.huggingface_token.as_deref(),
            SourceType::Direct => None,
        }
    }

    /// Run one download to completion, retrying transport errors with
    /// backoff (`spec.md` §4.F, §7).
    ///
    /// # Errors
    ///
    /// Returns the terminal [`DownloadError`] variant for the failure kind
    /// that stopped retrying.
    pub fn download(
        &self,
        request: &FetchRequest,
        mut progress: impl FnMut(u64, Option<u64>),
        cancel: &CancelToken,
    ) -> Result<FetchResult, DownloadError> {
        let _guard = self.lock_target(&request.target_relative_path);

        let mut attempt = 0;
        loop {
            match self.try_download(request, &mut progress, cancel) {
                Ok(result) => return Ok(result),
                Err(DownloadError::Transport { source, .. }) if attempt < MAX_RETRIES - 1 => {
                    let delay = BACKOFF_SCHEDULE
                        .get(usize::try_from(attempt).unwrap_or(usize::MAX))
                        .copied()
                        .unwrap_or(*BACKOFF_SCHEDULE.last().unwrap_or(&Duration::ZERO));
                    warn!(
                        "transport error downloading {}, retrying in {:?}: {source}",
                        request.url, delay
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(DownloadError::Transport { source, .. }) => {
                    return Err(DownloadError::Transport {
                        attempts: MAX_RETRIES,
                        source,
                    });
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn lock_target(&self, target_relative_path: &str) -> TargetGuard<'_> {
        loop {
            let mut locks = self
                .target_locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if locks.insert(target_relative_path.to_string()) {
                drop(locks);
                return TargetGuard {
                    downloader: self,
                    target: target_relative_path.to_string(),
                };
            }
            drop(locks);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn try_download(
        &self,
        request: &FetchRequest,
        progress: &mut impl FnMut(u64, Option<u64>),
        cancel: &CancelToken,
    ) -> Result<FetchResult, DownloadError> {
        let final_path = self.models_root.join(&request.target_relative_path);
        let mut temp_path = final_path.clone();
        temp_path.set_extension(extension_with_tmp(&final_path));

        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).map_err(|source| DownloadError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut builder = self.client.get(&request.url);
        if let Some(token) = self.bearer_token(&request.url) {
            builder = builder.bearer_auth(token);
        }

        info!("starting download of {}", request.url);
        let response = builder.send().map_err(|source| DownloadError::Transport {
            attempts: 1,
            source,
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let host = url_host(&request.url);
            return Err(DownloadError::AuthenticationRequired { host });
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound(request.url.clone()));
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(DownloadError::Forbidden(request.url.clone()));
        }
        if !status.is_success() {
            return Err(DownloadError::Transport {
                attempts: 1,
                source: response.error_for_status().unwrap_err(),
            });
        }

        let content_length = response.content_length();
        let mut file = fs::File::create(&temp_path).map_err(|source| DownloadError::Io {
            path: temp_path.clone(),
            source,
        })?;

        let mut blake3 = blake3::Hasher::new();
        let mut sha256 = <sha2::Sha256 as sha2::Digest>::new();
        let mut bytes_so_far: u64 = 0;
        let mut last_report = Instant::now();
        let mut body = response;
        let mut buf = [0u8; READ_CHUNK_BYTES];

        loop {
            if cancel.is_canceled() {
                drop(file);
                let _ = fs::remove_file(&temp_path);
                return Err(DownloadError::Canceled);
            }
            let read = body.read(&mut buf).map_err(|e| DownloadError::Io {
                path: temp_path.clone(),
                source: e,
            })?;
            if read == 0 {
                break;
            }
            file.write_all(&buf[..read])
                .map_err(|source| classify_write_error(&temp_path, source))?;
            blake3.update(&buf[..read]);
            sha2::Digest::update(&mut sha256, &buf[..read]);
            bytes_so_far += read as u64;

            if last_report.elapsed() >= PROGRESS_THROTTLE {
                progress(bytes_so_far, content_length);
                last_report = Instant::now();
            }
        }
        progress(bytes_so_far, content_length);

        file.sync_all().map_err(|source| DownloadError::Io {
            path: temp_path.clone(),
            source,
        })?;
        drop(file);

        let quick_hash = crate::hash::quick_hash_file(&temp_path)
            .map_err(|source| DownloadError::Io {
                path: temp_path.clone(),
                source: std::io::Error::other(source),
            })?
            .hash;

        if let Some(expected) = &request.expected_hash {
            if expected != &quick_hash {
                let _ = fs::remove_file(&temp_path);
                return Err(DownloadError::HashMismatch {
                    expected: expected.to_string(),
                    actual: quick_hash.to_string(),
                });
            }
        }

        fs::rename(&temp_path, &final_path).map_err(|source| DownloadError::Io {
            path: final_path.clone(),
            source,
        })?;

        info!("completed download of {} ({bytes_so_far} bytes)", request.url);
        Ok(FetchResult {
            final_path,
            quick_hash,
            sha256: Some(hex(&sha2::Digest::finalize(sha256))),
            blake3: blake3.finalize().to_hex().to_string(),
            bytes: bytes_so_far,
        })
    }
}

struct TargetGuard<'a> {
    downloader: &'a Downloader,
    target: String,
}

impl Drop for TargetGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .downloader
            .target_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.remove(&self.target);
    }
}

impl DownloadExecutor for Downloader {
    type Error = DownloadError;

    fn execute(&mut self, request: &DownloadRequest) -> Result<DownloadOutcome, Self::Error> {
        let fetch_request = FetchRequest {
            url: request.url.clone(),
            target_relative_path: request.target_relative_path.clone(),
            expected_size: None,
            expected_hash: None,
        };
        let result = self.download(&fetch_request, |_, _| {}, &CancelToken::new())?;
        let filename = Path::new(&request.target_relative_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(DownloadOutcome {
            hash: result.quick_hash,
            relative_path: request.target_relative_path.clone(),
            filename,
        })
    }
}

fn extension_with_tmp(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    }
}

fn classify_write_error(path: &Path, source: std::io::Error) -> DownloadError {
    if source.kind() == std::io::ErrorKind::StorageFull {
        DownloadError::DiskFull { path: path.to_path_buf() }
    } else {
        DownloadError::Io { path: path.to_path_buf(), source }
    }
}

fn url_host(url: &str) -> String {
    url.split("://")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(url)
        .to_string()
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_source_drives_token_selection() {
        let downloader = Downloader::new(
            PathBuf::from("/tmp"),
            Credentials {
                civitai_token: Some("civitai-token".to_string()),
                huggingface_token: Some("hf-token".to_string()),
            },
        )
        .unwrap();
        assert_eq!(
            downloader.bearer_token("https://civitai.com/api/download/1"),
            Some("civitai-token")
        );
        assert_eq!(
            downloader.bearer_token("https://huggingface.co/org/repo"),
            Some("hf-token")
        );
        assert_eq!(downloader.bearer_token("https://example.com/a.bin"), None);
    }

    #[test]
    fn url_host_extracts_the_authority() {
        assert_eq!(url_host("https://civitai.com/api/download/1"), "civitai.com");
    }

    #[test]
    fn cancel_token_starts_uncanceled() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());
        token.cancel();
        assert!(token.is_canceled());
    }

    #[test]
    fn temp_extension_preserves_the_original_suffix() {
        assert_eq!(
            extension_with_tmp(Path::new("checkpoints/a.safetensors")),
            "safetensors.tmp"
        );
        assert_eq!(extension_with_tmp(Path::new("checkpoints/a")), "tmp");
    }
}
