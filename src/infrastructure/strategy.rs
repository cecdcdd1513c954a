//! Concrete `ResolutionStrategy` adapters (`spec.md` §4.E "Polymorphism over
//! strategies": an interactive terminal strategy, an auto strategy, and a
//! scripted strategy that reads a mapping file).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use console::Term;
use thiserror::Error;

use crate::domain::resolution::{ModelCandidate, ResolutionDecision, ResolutionStrategy};
use crate::domain::workflow::ModelReference;

/// Picks the first candidate when ambiguous, marks unresolved references
/// optional rather than blocking a batch run (`spec.md` §4.E).
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoStrategy;

impl ResolutionStrategy for AutoStrategy {
    fn on_ambiguous(
        &mut self,
        candidates: &[ModelCandidate],
        _reference: &ModelReference,
    ) -> ResolutionDecision {
        candidates
            .first()
            .cloned()
            .map_or(ResolutionDecision::MarkOptional, ResolutionDecision::Select)
    }

    fn on_unresolved(&mut self, _reference: &ModelReference) -> ResolutionDecision {
        ResolutionDecision::MarkOptional
    }
}

/// Errors loading a scripted strategy's mapping file.
#[derive(Debug, Error)]
pub enum ScriptedStrategyError {
    #[error("failed to read mapping file: {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse mapping file: {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Resolves ambiguous or unresolved references by consulting a
/// `widget_value -> relative_path` mapping loaded once from a JSON file
/// (`spec.md` §4.E "a scripted strategy (reads a mapping file)").
#[derive(Debug, Clone, Default)]
pub struct ScriptedStrategy {
    mapping: HashMap<String, String>,
}

impl ScriptedStrategy {
    /// # Errors
    ///
    /// Returns [`ScriptedStrategyError`] if `path` cannot be read or does
    /// not parse as a JSON object of `widget_value -> relative_path` pairs.
    pub fn load(path: &Path) -> Result<Self, ScriptedStrategyError> {
        let content = fs::read_to_string(path).map_err(|source| ScriptedStrategyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mapping =
            serde_json::from_str(&content).map_err(|source| ScriptedStrategyError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self { mapping })
    }

    #[must_use]
    pub fn from_mapping(mapping: HashMap<String, String>) -> Self {
        Self { mapping }
    }

    fn decide(&self, candidates: &[ModelCandidate], reference: &ModelReference) -> ResolutionDecision {
        let Some(target_path) = self.mapping.get(&reference.widget_value) else {
            return ResolutionDecision::Skip;
        };
        candidates
            .iter()
            .find(|c| &c.relative_path == target_path)
            .cloned()
            .map_or(ResolutionDecision::Skip, ResolutionDecision::Select)
    }
}

impl ResolutionStrategy for ScriptedStrategy {
    fn on_ambiguous(
        &mut self,
        candidates: &[ModelCandidate],
        reference: &ModelReference,
    ) -> ResolutionDecision {
        self.decide(candidates, reference)
    }

    fn on_unresolved(&mut self, reference: &ModelReference) -> ResolutionDecision {
        self.decide(&[], reference)
    }
}

/// What a terminal reply means, factored out of terminal I/O so it can be
/// tested without a real `Term`.
fn parse_reply(reply: &str, candidates: &[ModelCandidate]) -> ResolutionDecision {
    match reply.trim() {
        "s" => ResolutionDecision::Skip,
        "o" => ResolutionDecision::MarkOptional,
        choice => choice
            .parse::<usize>()
            .ok()
            .and_then(|index| candidates.get(index))
            .cloned()
            .map_or(ResolutionDecision::Skip, ResolutionDecision::Select),
    }
}

/// Prompts on the terminal for each ambiguous or unresolved reference
/// (`spec.md` §4.E "an interactive terminal strategy").
pub struct InteractiveStrategy {
    term: Term,
}

impl InteractiveStrategy {
    #[must_use]
    pub fn new() -> Self {
        Self { term: Term::stdout() }
    }

    fn prompt(&self, candidates: &[ModelCandidate], reference: &ModelReference) -> ResolutionDecision {
        let _ = self.term.write_line(&format!(
            "{} ({} candidate(s)) referenced by {}:",
            reference.widget_value,
            candidates.len(),
            reference.node_type
        ));
        for (index, candidate) in candidates.iter().enumerate() {
            let _ = self.term.write_line(&format!("  [{index}] {}", candidate.relative_path));
        }
        let _ = self.term.write_line("  [s]kip   [o]ptional");
        let Ok(reply) = self.term.read_line() else {
            return ResolutionDecision::Skip;
        };
        parse_reply(&reply, candidates)
    }
}

impl Default for InteractiveStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionStrategy for InteractiveStrategy {
    fn on_ambiguous(
        &mut self,
        candidates: &[ModelCandidate],
        reference: &ModelReference,
    ) -> ResolutionDecision {
        self.prompt(candidates, reference)
    }

    fn on_unresolved(&mut self, reference: &ModelReference) -> ResolutionDecision {
        self.prompt(&[], reference)
    }
}
