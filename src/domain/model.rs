//! Domain entity for a single model's identity, locations, and sources.
//! No I/O — persistence is handled by `infrastructure::index`'s `ModelIndexStore`.

use std::collections::HashMap;

use time::OffsetDateTime;

use crate::hash::QuickHash;

/// Where a download for a model came from, classified by URL host
/// (`spec.md` §6.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SourceType {
    #[serde(rename = "civitai")]
    Civitai,
    #[serde(rename = "huggingface")]
    HuggingFace,
    #[serde(rename = "direct")]
    Direct,
}

impl SourceType {
    /// Classify a URL by host substring, per `spec.md` §6.7: civitai.com,
    /// then huggingface.co/hf.co, else direct.
    #[must_use]
    pub fn classify(url: &str) -> Self {
        if url.contains("civitai.com") {
            Self::Civitai
        } else if url.contains("huggingface.co") || url.contains("hf.co") {
            Self::HuggingFace
        } else {
            Self::Direct
        }
    }
}

/// A single on-disk occurrence of a model, relative to the workspace models
/// root. Identity is by quick-hash, not by path — a model may have several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub relative_path: String,
    pub filename: String,
    pub mtime: i64,
    pub last_seen: i64,
}

/// A registered download source for a model. URLs are unique per model.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub source_type: SourceType,
    pub url: String,
    pub metadata: HashMap<String, String>,
    pub added_at: OffsetDateTime,
}

/// A cataloged model: identity, size, optional strong digests, and the
/// locations/sources that justify its presence in the index.
///
/// Invariant (enforced by callers, not representable here to keep this a
/// plain data holder): a `Model` is retained in the index only while it has
/// at least one location or one source (`spec.md` §3.1).
#[derive(Debug, Clone)]
pub struct Model {
    pub hash: QuickHash,
    pub size: u64,
    pub sha256: Option<String>,
    pub blake3: Option<String>,
    pub indexed_at: OffsetDateTime,
    locations: Vec<Location>,
    sources: Vec<Source>,
}

impl Model {
    #[must_use]
    pub fn new(hash: QuickHash, size: u64, indexed_at: OffsetDateTime) -> Self {
        Self {
            hash,
            size,
            sha256: None,
            blake3: None,
            indexed_at,
            locations: Vec::new(),
            sources: Vec::new(),
        }
    }

    #[must_use]
    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    #[must_use]
    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// Insert or refresh a location. Two locations with the same
    /// `relative_path` collapse into one (`spec.md` §3.1).
    pub fn upsert_location(&mut self, location: Location) {
        if let Some(existing) = self
            .locations
            .iter_mut()
            .find(|l| l.relative_path == location.relative_path)
        {
            *existing = location;
        } else {
            self.locations.push(location);
        }
    }

    /// Remove a location by path. Returns whether anything was removed.
    pub fn remove_location(&mut self, relative_path: &str) -> bool {
        let before = self.locations.len();
        self.locations.retain(|l| l.relative_path != relative_path);
        self.locations.len() != before
    }

    /// Idempotent on `(hash, url)`: adding the same URL twice is a no-op.
    pub fn add_source(&mut self, source: Source) {
        if !self.sources.iter().any(|s| s.url == source.url) {
            self.sources.push(source);
        }
    }

    /// Strong digests are immutable once set (`spec.md` §3.1). Returns
    /// `false` (and leaves the model untouched) if a digest is already
    /// present and would differ.
    #[must_use]
    pub fn set_strong_digests(&mut self, sha256: Option<String>, blake3: Option<String>) -> bool {
        if let (Some(existing), Some(new)) = (&self.sha256, &sha256) {
            if existing != new {
                return false;
            }
        }
        if let (Some(existing), Some(new)) = (&self.blake3, &blake3) {
            if existing != new {
                return false;
            }
        }
        if self.sha256.is_none() {
            self.sha256 = sha256;
        }
        if self.blake3.is_none() {
            self.blake3 = blake3;
        }
        true
    }

    /// A model with no locations and no sources should be deleted from the
    /// index (`spec.md` §3.1 "Lifecycle").
    #[must_use]
    pub fn is_orphan(&self) -> bool {
        self.locations.is_empty() && self.sources.is_empty()
    }
}
