//! The loader category table (`spec.md` §6.4): a fixed mapping from ComfyUI
//! loader node types to the model category and widget slot that names a
//! filename. Consulted by the workflow parser and the resolver.

/// A model category, e.g. `checkpoints` or `loras`. Carries the on-disk
/// directory segment a location's `relative_path` is expected to start with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The category used when a loader node type is not in the table.
    /// Carried, never dropped — `spec.md` §9 "Open question".
    #[must_use]
    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where in a loader node's widget list the model filename lives, plus which
/// category it belongs to.
#[derive(Debug, Clone, Copy)]
pub struct LoaderSlot {
    pub category: &'static str,
    pub widget_index: usize,
}

/// Fixed `node_type -> (category, widget_index)` table. Extensible: unknown
/// loader types still produce references under `Category::unknown()` rather
/// than being dropped (§9).
const LOADER_TABLE: &[(&str, LoaderSlot)] = &[
    (
        "CheckpointLoaderSimple",
        LoaderSlot {
            category: "checkpoints",
            widget_index: 0,
        },
    ),
    (
        "CheckpointLoader",
        LoaderSlot {
            category: "checkpoints",
            widget_index: 0,
        },
    ),
    (
        "LoraLoader",
        LoaderSlot {
            category: "loras",
            widget_index: 0,
        },
    ),
    (
        "LoraLoaderModelOnly",
        LoaderSlot {
            category: "loras",
            widget_index: 0,
        },
    ),
    (
        "VAELoader",
        LoaderSlot {
            category: "vae",
            widget_index: 0,
        },
    ),
    (
        "ControlNetLoader",
        LoaderSlot {
            category: "controlnet",
            widget_index: 0,
        },
    ),
    (
        "DiffControlNetLoader",
        LoaderSlot {
            category: "controlnet",
            widget_index: 0,
        },
    ),
    (
        "UpscaleModelLoader",
        LoaderSlot {
            category: "upscale_models",
            widget_index: 0,
        },
    ),
    (
        "CLIPLoader",
        LoaderSlot {
            category: "clip_vision",
            widget_index: 0,
        },
    ),
    (
        "CLIPVisionLoader",
        LoaderSlot {
            category: "clip_vision",
            widget_index: 0,
        },
    ),
    (
        "StyleModelLoader",
        LoaderSlot {
            category: "style_models",
            widget_index: 0,
        },
    ),
    (
        "unCLIPCheckpointLoader",
        LoaderSlot {
            category: "checkpoints",
            widget_index: 0,
        },
    ),
];

/// Look up the `(category, widget_index)` slot for a loader node type.
///
/// Returns `None` when `node_type` is not a recognized loader at all (it is
/// not a model-reference-bearing node). A recognized-but-uncategorized type
/// is never produced by this table — every entry is explicit.
#[must_use]
pub fn loader_slot(node_type: &str) -> Option<LoaderSlot> {
    LOADER_TABLE
        .iter()
        .find(|(name, _)| *name == node_type)
        .map(|(_, slot)| *slot)
}

/// All node types this table recognizes as builtin loaders. Used by the
/// parser to classify everything else as a custom node candidate.
#[must_use]
pub fn builtin_node_types() -> impl Iterator<Item = &'static str> {
    LOADER_TABLE.iter().map(|(name, _)| *name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_loader_resolves_category_and_widget_index() {
        let slot = loader_slot("CheckpointLoaderSimple").unwrap();
        assert_eq!(slot.category, "checkpoints");
        assert_eq!(slot.widget_index, 0);
    }

    #[test]
    fn unknown_loader_returns_none_from_table() {
        assert!(loader_slot("SomeFutureLoaderNode").is_none());
    }

    #[test]
    fn unknown_category_constructor_is_stable() {
        assert_eq!(Category::unknown().as_str(), "unknown");
    }

    #[test]
    fn builtin_node_types_contains_known_entries() {
        let types: Vec<&str> = builtin_node_types().collect();
        assert!(types.contains(&"LoraLoader"));
    }
}
