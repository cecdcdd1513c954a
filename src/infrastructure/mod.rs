pub mod analyzer;
pub mod downloader;
pub mod finalizer;
pub mod git;
pub mod index;
pub mod installer;
pub mod manifest_store;
pub mod packager;
pub mod strategy;
pub mod workflow_parser;

pub use analyzer::{analyze, AnalysisReport, ModelStrategy, ModelSummary, NodeCounts};
pub use downloader::{CancelToken, Credentials, DownloadError, Downloader, FetchRequest, FetchResult};
pub use finalizer::{finalize, FinalizeContext, FinalizeError, ImportResult, ItemEvent, Phase};
pub use git::{GitCollaborator, GitError, SystemGit};
pub use index::{IndexError, ModelIndex, ScanReport};
pub use installer::{DependencyGroup, InstallerError, PythonInstaller, UvInstaller};
pub use manifest_store::{FileManifestStore, ManifestStore, ManifestStoreError, MemoryManifestStore};
pub use packager::{export, import, ExportPreflight, ExportSources, PackagerError};
pub use strategy::{AutoStrategy, InteractiveStrategy, ScriptedStrategy, ScriptedStrategyError};
pub use workflow_parser::{parse, ParsedWorkflow, WorkflowParseError};
