pub mod category;
pub mod manifest;
pub mod model;
pub mod node;
pub mod resolution;
pub mod workflow;

pub use category::{Category, LoaderSlot};
pub use manifest::{ComfyUiVersion, EnvironmentMeta, GlobalModelEntry, Manifest, ManifestError};
pub use model::{Location, Model, Source, SourceType};
pub use node::{NodeEntry, NodeSource, NodeTable};
pub use resolution::{
    promoted_criticality, resolve, DownloadExecutor, DownloadOutcome, DownloadRequest,
    ModelCandidate, ModelLookup, ReferenceOutcome, ResolutionDecision, ResolutionError,
    ResolutionResult, ResolutionStrategy,
};
pub use workflow::{Criticality, ModelReference, ReferenceStatus, Workflow};
