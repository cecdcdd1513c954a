//! Extracts model and custom-node references from a ComfyUI workflow graph
//! (`spec.md` §4.D). The graph itself stays opaque JSON beyond the fields
//! read here.

use std::collections::HashSet;

use thiserror::Error;

use crate::domain::category::{self, Category};
use crate::domain::workflow::ModelReference;

/// Errors raised parsing a workflow graph.
#[derive(Debug, Error)]
pub enum WorkflowParseError {
    #[error("workflow graph is not a JSON object")]
    NotAnObject,

    #[error("workflow graph has no 'nodes' array")]
    MissingNodes,
}

/// Everything the parser extracted from one workflow graph.
#[derive(Debug, Default)]
pub struct ParsedWorkflow {
    pub references: Vec<ModelReference>,
    /// Node types seen in the graph that aren't in the builtin loader table
    /// (`spec.md` §4.D "Custom node detection").
    pub custom_node_types: HashSet<String>,
}

/// Parse a ComfyUI workflow graph (the `"nodes"` array form) into raw model
/// references plus the set of non-builtin node types present.
///
/// Nodes whose relevant widget value is an empty string are ignored
/// (`spec.md` §8 "Boundary behavior").
///
/// # Errors
///
/// Returns [`WorkflowParseError`] if `graph` isn't a JSON object with a
/// `"nodes"` array.
pub fn parse(graph: &serde_json::Value) -> Result<ParsedWorkflow, WorkflowParseError> {
    let object = graph.as_object().ok_or(WorkflowParseError::NotAnObject)?;
    let nodes = object
        .get("nodes")
        .and_then(serde_json::Value::as_array)
        .ok_or(WorkflowParseError::MissingNodes)?;

    let mut parsed = ParsedWorkflow::default();
    for node in nodes {
        let Some(node_id) = node_id(node) else {
            continue;
        };
        let Some(node_type) = node.get("type").and_then(serde_json::Value::as_str) else {
            continue;
        };

        let Some(slot) = category::loader_slot(node_type) else {
            parsed.custom_node_types.insert(node_type.to_string());
            continue;
        };

        let Some(widgets) = node.get("widgets_values").and_then(serde_json::Value::as_array)
        else {
            continue;
        };
        let Some(widget_value) = widgets
            .get(slot.widget_index)
            .and_then(serde_json::Value::as_str)
        else {
            continue;
        };
        if widget_value.is_empty() {
            continue;
        }

        parsed.references.push(ModelReference::unresolved(
            node_id,
            node_type.to_string(),
            slot.widget_index,
            widget_value.to_string(),
            Category::from(slot.category),
        ));
    }

    Ok(parsed)
}

fn node_id(node: &serde_json::Value) -> Option<String> {
    match node.get("id")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
