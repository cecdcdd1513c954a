//! Custom node entries tracked by an environment (`spec.md` §3.3).

/// Where a custom node's code comes from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeSource {
    /// A ComfyUI registry package, optionally pinned to a version.
    Registry { id: String, version: Option<String> },
    /// A git repository, optionally pinned to a commit or tag.
    Git { url: String, reference: Option<String> },
    /// Local, unpublished source bundled into the export archive.
    Development { local_path: String },
}

impl NodeSource {
    /// Registry and git entries carry everything needed to reinstall from
    /// `install_spec` alone; development entries need their bundled source
    /// (`spec.md` §3.3).
    #[must_use]
    pub fn requires_bundled_source(&self) -> bool {
        matches!(self, Self::Development { .. })
    }
}

/// One installed custom node's tracked identity and Python requirements.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub source: NodeSource,
    /// Version-constrained package specifiers, e.g. `"numpy>=1.26"`.
    pub python_requirements: Vec<String>,
}

impl NodeEntry {
    #[must_use]
    pub fn new(name: String, source: NodeSource) -> Self {
        Self {
            name,
            source,
            python_requirements: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_development(&self) -> bool {
        self.source.requires_bundled_source()
    }
}

/// A name-keyed set of node entries, enforcing the "exactly one entry per
/// name" invariant (`spec.md` §3.3).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeTable {
    entries: Vec<NodeEntry>,
}

impl NodeTable {
    #[must_use]
    pub fn entries(&self) -> &[NodeEntry] {
        &self.entries
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NodeEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Insert a new entry or replace the existing one with the same name.
    pub fn put(&mut self, entry: NodeEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.name == entry.name) {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    /// Returns whether an entry with `name` was present and removed.
    pub fn delete(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        self.entries.len() != before
    }
}
