//! The tracked binding half of a workflow: model references and their
//! resolution state. The JSON graph itself is opaque here; see
//! `infrastructure::workflow_parser` for graph extraction.

use crate::domain::category::Category;
use crate::hash::QuickHash;

/// How strictly a reference must be satisfied for the workflow to be
/// considered commit-safe (`spec.md` §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Optional,
    Flexible,
    Required,
}

impl Criticality {
    /// The stronger of two criticalities, used when the same hash is
    /// referenced by multiple workflows (`spec.md` §4.E "Criticality promotion").
    #[must_use]
    pub fn promote(self, other: Self) -> Self {
        self.max(other)
    }
}

/// Whether a reference currently names a model present in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceStatus {
    Resolved,
    Unresolved,
}

/// One loader node's filename widget, tracked across resolution attempts.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ModelReference {
    pub node_id: String,
    pub node_type: String,
    pub widget_index: usize,
    pub widget_value: String,
    pub criticality: Criticality,
    pub category: Category,
    pub status: ReferenceStatus,
    /// Present iff `status == Resolved`.
    pub hash: Option<QuickHash>,
}

impl ModelReference {
    /// A freshly parsed, not-yet-resolved reference.
    #[must_use]
    pub fn unresolved(
        node_id: String,
        node_type: String,
        widget_index: usize,
        widget_value: String,
        category: Category,
    ) -> Self {
        Self {
            node_id,
            node_type,
            widget_index,
            widget_value,
            criticality: Criticality::Required,
            category,
            status: ReferenceStatus::Unresolved,
            hash: None,
        }
    }

    /// The `(node_id, widget_index)` pair that identifies this reference
    /// uniquely within a workflow (`spec.md` §3.2).
    #[must_use]
    pub fn key(&self) -> (&str, usize) {
        (&self.node_id, self.widget_index)
    }

    pub fn mark_resolved(&mut self, hash: QuickHash) {
        self.hash = Some(hash);
        self.status = ReferenceStatus::Resolved;
    }

    /// `spec.md` §9 open question: a resolved reference whose backing hash
    /// is pruned from the index reverts to unresolved; no auto-redownload.
    pub fn revert_to_unresolved(&mut self) {
        self.hash = None;
        self.status = ReferenceStatus::Unresolved;
    }

    pub fn mark_optional(&mut self) {
        self.criticality = Criticality::Optional;
    }

    /// `spec.md` §3.2: satisfied if resolved, optional, or force-overridden.
    #[must_use]
    pub fn is_commit_safe(&self, force_override: bool) -> bool {
        self.status == ReferenceStatus::Resolved
            || self.criticality == Criticality::Optional
            || force_override
    }
}

/// A workflow's tracked binding: its relative path plus the reference list
/// extracted from its graph.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Workflow {
    pub name: String,
    pub path: String,
    pub references: Vec<ModelReference>,
}

impl Workflow {
    #[must_use]
    pub fn new(name: String, path: String) -> Self {
        Self {
            name,
            path,
            references: Vec::new(),
        }
    }

    /// A workflow with zero references is trivially commit-safe
    /// (`spec.md` §8 "Boundary behavior").
    #[must_use]
    pub fn is_commit_safe(&self, force_override: bool) -> bool {
        self.references
            .iter()
            .all(|r| r.is_commit_safe(force_override))
    }

    /// Look up a reference by its `(node_id, widget_index)` identity.
    #[must_use]
    pub fn find_reference(&self, node_id: &str, widget_index: usize) -> Option<&ModelReference> {
        self.references
            .iter()
            .find(|r| r.key() == (node_id, widget_index))
    }

    #[must_use]
    pub fn find_reference_mut(
        &mut self,
        node_id: &str,
        widget_index: usize,
    ) -> Option<&mut ModelReference> {
        self.references
            .iter_mut()
            .find(|r| r.key() == (node_id, widget_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(node_id: &str, widget_index: usize) -> ModelReference {
        ModelReference::unresolved(
            node_id.to_string(),
            "CheckpointLoaderSimple".to_string(),
            widget_index,
            "model.safetensors".to_string(),
            Category::from("checkpoints"),
        )
    }

    #[test]
    fn criticality_promotion_keeps_the_stronger_value() {
        assert_eq!(
            Criticality::Optional.promote(Criticality::Required),
            Criticality::Required
        );
        assert_eq!(
            Criticality::Flexible.promote(Criticality::Optional),
            Criticality::Flexible
        );
    }

    #[test]
    fn unresolved_required_reference_is_not_commit_safe() {
        let r = reference("1", 0);
        assert!(!r.is_commit_safe(false));
        assert!(r.is_commit_safe(true));
    }

    #[test]
    fn optional_reference_is_always_commit_safe() {
        let mut r = reference("1", 0);
        r.mark_optional();
        assert!(r.is_commit_safe(false));
    }

    #[test]
    fn resolving_then_reverting_round_trips_status() {
        let mut r = reference("1", 0);
        r.mark_resolved(QuickHash::from("abc"));
        assert_eq!(r.status, ReferenceStatus::Resolved);
        r.revert_to_unresolved();
        assert_eq!(r.status, ReferenceStatus::Unresolved);
        assert!(r.hash.is_none());
    }

    #[test]
    fn workflow_with_no_references_is_commit_safe() {
        let workflow = Workflow::new("empty".to_string(), "workflows/empty.json".to_string());
        assert!(workflow.is_commit_safe(false));
    }

    #[test]
    fn workflow_commit_safety_requires_every_reference_satisfied() {
        let mut workflow = Workflow::new("w".to_string(), "workflows/w.json".to_string());
        workflow.references.push(reference("1", 0));
        assert!(!workflow.is_commit_safe(false));
        workflow
            .find_reference_mut("1", 0)
            .unwrap()
            .mark_resolved(QuickHash::from("abc"));
        assert!(workflow.is_commit_safe(false));
    }
}
