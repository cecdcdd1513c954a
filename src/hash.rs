//! Content hashing primitives shared by the model index and the downloader.
//!
//! Two digest families are used throughout the core:
//!
//! - The **quick-hash**: a sampled 192-bit BLAKE3 digest used as the primary
//!   content identifier for models on disk. Cheap enough to recompute on
//!   every scan even for multi-gigabyte checkpoints.
//! - **Strong digests**: full SHA-256 and full BLAKE3 over the entire byte
//!   stream, computed lazily (export time, inline during download).

use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Window size sampled from the front, middle, and end of a file for the
/// quick-hash, per `spec.md` §3.1.
const WINDOW_BYTES: u64 = 15 * 1024 * 1024;
/// Half-width of the middle window.
const HALF_WINDOW_BYTES: u64 = WINDOW_BYTES / 2;
/// Files smaller than this are quick-hashed over their full contents instead
/// of three overlapping windows.
const FULL_HASH_THRESHOLD_BYTES: u64 = 45 * 1024 * 1024;
/// The quick-hash is a 192-bit (24-byte) BLAKE3 output.
const QUICK_HASH_OUTPUT_BYTES: usize = 24;
/// Read buffer size used while streaming file contents into a hasher.
const READ_CHUNK_BYTES: usize = 1024 * 1024;
/// Progress callbacks are throttled to at most this frequently.
const PROGRESS_THROTTLE: Duration = Duration::from_millis(250);

/// Errors produced by hashing operations.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("failed to read {}", path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A 192-bit quick-hash, rendered as lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct QuickHash(String);

impl QuickHash {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_bytes(bytes: &[u8; QUICK_HASH_OUTPUT_BYTES]) -> Self {
        Self(hex_encode(bytes))
    }
}

impl std::fmt::Display for QuickHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QuickHash {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for QuickHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Result of quick-hashing a file: its identity plus the size that was
/// folded into the digest as a trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickHashResult {
    pub hash: QuickHash,
    pub size: u64,
}

/// Quick-hash a file at `path`.
///
/// Files under 45 MiB are hashed in full (with the size trailer appended).
/// Larger files are hashed over three 15 MiB windows — front, middle, end —
/// plus the same size trailer, per `spec.md` §3.1.
///
/// # Errors
///
/// Returns [`HashError::Io`] if the file cannot be opened or read.
pub fn quick_hash_file(path: &Path) -> Result<QuickHashResult, HashError> {
    let mut file = std::fs::File::open(path).map_err(|source| HashError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let size = file
        .metadata()
        .map_err(|source| HashError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .len();

    let mut hasher = blake3::Hasher::new();
    if size < FULL_HASH_THRESHOLD_BYTES {
        std::io::copy(&mut file, &mut hasher).map_err(|source| HashError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    } else {
        for (start, len) in window_ranges(size) {
            hash_window(&mut file, &mut hasher, start, len).map_err(|source| HashError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }
    hasher.update(&size.to_le_bytes());

    let mut output = [0u8; QUICK_HASH_OUTPUT_BYTES];
    hasher.finalize_xof().fill(&mut output);

    Ok(QuickHashResult {
        hash: QuickHash::from_bytes(&output),
        size,
    })
}

/// Compute the `(start, len)` byte ranges of the three sampling windows for
/// a file of the given size. Only meaningful for `size >= FULL_HASH_THRESHOLD_BYTES`.
fn window_ranges(size: u64) -> [(u64, u64); 3] {
    let front = (0, WINDOW_BYTES.min(size));
    let mid_center = size / 2;
    let mid_start = mid_center.saturating_sub(HALF_WINDOW_BYTES);
    let mid_end = (mid_center + HALF_WINDOW_BYTES).min(size);
    let middle = (mid_start, mid_end - mid_start);
    let end_start = size.saturating_sub(WINDOW_BYTES);
    let end = (end_start, size - end_start);
    [front, middle, end]
}

fn hash_window(
    file: &mut std::fs::File,
    hasher: &mut blake3::Hasher,
    start: u64,
    len: u64,
) -> std::io::Result<()> {
    use std::io::Seek;
    file.seek(std::io::SeekFrom::Start(start))?;
    let mut remaining = len;
    let mut buf = [0u8; READ_CHUNK_BYTES];
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
        let read = file.read(&mut buf[..want])?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        remaining -= read as u64;
    }
    Ok(())
}

/// Which strong digests to compute during a streaming hash pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrongDigestRequest {
    pub sha256: bool,
    pub blake3: bool,
}

/// Strong digests produced by [`stream_hash`] or [`stream_hash_with_progress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrongDigests {
    pub sha256: Option<String>,
    pub blake3: Option<String>,
}

/// Consume `reader` once, computing whichever digests `request` asks for.
///
/// # Errors
///
/// Returns an error if reading from `reader` fails.
pub fn stream_hash<R: Read>(
    reader: &mut R,
    request: StrongDigestRequest,
) -> std::io::Result<StrongDigests> {
    stream_hash_with_progress(reader, request, |_, _| {})
}

/// As [`stream_hash`], invoking `progress` at most every 250ms and at each
/// chunk boundary of at least 1 MiB, with `(bytes_so_far, total_or_none)`.
///
/// `total` is always `None` here since a bare reader carries no length; the
/// downloader passes a known content length through its own progress path.
///
/// # Errors
///
/// Returns an error if reading from `reader` fails.
pub fn stream_hash_with_progress<R: Read, F: FnMut(u64, Option<u64>)>(
    reader: &mut R,
    request: StrongDigestRequest,
    mut progress: F,
) -> std::io::Result<StrongDigests> {
    let mut sha256 = request.sha256.then(Sha256::new);
    let mut blake3 = request.blake3.then(blake3::Hasher::new);

    let mut buf = [0u8; READ_CHUNK_BYTES];
    let mut bytes_so_far: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        let read = reader.read(&mut buf)?;
        if read == 0 {
            break;
        }
        if let Some(hasher) = sha256.as_mut() {
            hasher.update(&buf[..read]);
        }
        if let Some(hasher) = blake3.as_mut() {
            hasher.update(&buf[..read]);
        }
        bytes_so_far += read as u64;

        if last_report.elapsed() >= PROGRESS_THROTTLE {
            progress(bytes_so_far, None);
            last_report = Instant::now();
        }
    }
    progress(bytes_so_far, None);

    Ok(StrongDigests {
        sha256: sha256.map(|h| hex_encode(&h.finalize())),
        blake3: blake3.map(|h| h.finalize().to_hex().to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn quick_hash_is_deterministic() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&vec![7u8; 1024]).unwrap();
        let a = quick_hash_file(file.path()).unwrap();
        let b = quick_hash_file(file.path()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn quick_hash_of_zero_byte_file_is_defined() {
        let file = NamedTempFile::new().unwrap();
        let result = quick_hash_file(file.path()).unwrap();
        assert_eq!(result.size, 0);
        assert_eq!(result.hash.as_str().len(), QUICK_HASH_OUTPUT_BYTES * 2);
    }

    #[test]
    fn quick_hash_differs_for_different_content() {
        let mut a = NamedTempFile::new().unwrap();
        a.write_all(b"alpha").unwrap();
        let mut b = NamedTempFile::new().unwrap();
        b.write_all(b"beta").unwrap();
        assert_ne!(
            quick_hash_file(a.path()).unwrap().hash,
            quick_hash_file(b.path()).unwrap().hash
        );
    }

    #[test]
    fn quick_hash_is_stable_across_file_moves() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("a.bin");
        std::fs::write(&original, vec![3u8; 4096]).unwrap();
        let before = quick_hash_file(&original).unwrap();

        let moved = dir.path().join("moved.bin");
        std::fs::rename(&original, &moved).unwrap();
        let after = quick_hash_file(&moved).unwrap();

        assert_eq!(before.hash, after.hash);
    }

    #[test]
    fn window_ranges_cover_front_middle_end_without_exceeding_size() {
        let size = 100 * 1024 * 1024;
        let ranges = window_ranges(size);
        for (start, len) in ranges {
            assert!(start + len <= size);
        }
        assert_eq!(ranges[0].0, 0);
        assert_eq!(ranges[2].0 + ranges[2].1, size);
    }

    #[test]
    fn stream_hash_computes_requested_digests_only() {
        let mut data: &[u8] = b"hello world";
        let digests = stream_hash(
            &mut data,
            StrongDigestRequest {
                sha256: true,
                blake3: false,
            },
        )
        .unwrap();
        assert!(digests.sha256.is_some());
        assert!(digests.blake3.is_none());
    }

    #[test]
    fn stream_hash_with_progress_reports_final_total() {
        let mut data: &[u8] = &vec![1u8; READ_CHUNK_BYTES * 2];
        let mut last_seen = 0u64;
        stream_hash_with_progress(
            &mut data,
            StrongDigestRequest::default(),
            |bytes_so_far, _| last_seen = bytes_so_far,
        )
        .unwrap();
        assert_eq!(last_seen, (READ_CHUNK_BYTES * 2) as u64);
    }
}
