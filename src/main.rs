use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};

use comfydock_core::config::Config;
use comfydock_core::domain::resolve;
use comfydock_core::infrastructure::{
    self, AutoStrategy, Downloader, FileManifestStore, InteractiveStrategy,
    ManifestStore, ModelIndex, ScriptedStrategy,
};

#[derive(Parser)]
#[command(name = "comfydock")]
#[command(about = "Reproducible ComfyUI environments", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan the models root and update the model index
    Index {
        #[arg(long)]
        models_root: Option<PathBuf>,
    },
    /// Preview what importing an extracted environment would do
    Analyze {
        /// Path to an extracted environment's pyproject.toml
        manifest_path: PathBuf,
        #[arg(long)]
        models_root: Option<PathBuf>,
    },
    /// Export an environment's configuration directory into an archive
    Export {
        config_dir: PathBuf,
        output: PathBuf,
    },
    /// Import an environment archive into a configuration directory
    Import {
        archive: PathBuf,
        target_dir: PathBuf,
    },
    /// Resolve a workflow's model references against the local index,
    /// downloading or prompting for anything still unresolved
    Resolve {
        /// Path to an extracted environment's pyproject.toml
        manifest_path: PathBuf,
        workflow_name: String,
        #[arg(long)]
        models_root: Option<PathBuf>,
        #[command(subcommand)]
        strategy: Option<StrategyArg>,
    },
}

#[derive(Subcommand)]
enum StrategyArg {
    /// Pick the first candidate, mark the rest optional (the default)
    Auto,
    /// Prompt on the terminal for every ambiguous or unresolved reference
    Interactive,
    /// Decide from a `widget_value -> relative_path` JSON mapping file
    Scripted { mapping_path: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    let config = Config::from_env();

    match cli.command {
        Commands::Index { models_root } => run_index(&config, models_root)?,
        Commands::Analyze { manifest_path, models_root } => run_analyze(&config, &manifest_path, models_root)?,
        Commands::Export { config_dir, output } => run_export(&config_dir, &output)?,
        Commands::Import { archive, target_dir } => run_import(&archive, &target_dir)?,
        Commands::Resolve { manifest_path, workflow_name, models_root, strategy } => {
            run_resolve(&config, &manifest_path, &workflow_name, models_root, strategy)?;
        }
    }

    Ok(())
}

fn run_index(config: &Config, models_root: Option<PathBuf>) -> Result<()> {
    let root = models_root.unwrap_or_else(|| config.models_root.clone());
    let index_path = config.cache_dir.join("model_index.json");
    std::fs::create_dir_all(&config.cache_dir).context("creating cache directory")?;

    let index = ModelIndex::load_or_default(&index_path).context("loading model index")?;
    let report = index
        .scan(&root, |path| log::debug!("scanned {}", path.display()))
        .context("scanning models root")?;
    index.save().context("saving model index")?;

    log::info!(
        "index updated: {} added, {} updated, {} pruned, {} unchanged",
        report.added,
        report.updated,
        report.pruned,
        report.unchanged
    );
    Ok(())
}

fn run_analyze(config: &Config, manifest_path: &std::path::Path, models_root: Option<PathBuf>) -> Result<()> {
    let store = FileManifestStore::load(manifest_path).context("loading persistent manifest")?;
    let root = models_root.unwrap_or_else(|| config.models_root.clone());
    let index_path = config.cache_dir.join("model_index.json");
    let index = ModelIndex::load_or_default(&index_path).context("loading model index")?;
    index.scan(&root, |_| {}).context("scanning models root")?;

    let report = infrastructure::analyze(store.manifest(), &|hash| index.has_model(hash));
    log::info!(
        "{} workflow(s), {}/{} model(s) available locally, {} need download, {} lack a source",
        report.workflow_count,
        report.available_locally,
        report.total_models,
        report.need_download,
        report.lacking_sources
    );
    log::info!("recommended strategy: {:?}", report.recommend_strategy());
    Ok(())
}

fn run_export(config_dir: &std::path::Path, output: &std::path::Path) -> Result<()> {
    let manifest_json = std::fs::read(config_dir.join("manifest.json")).context("reading manifest.json")?;
    let persistent_manifest_toml =
        std::fs::read(config_dir.join("pyproject.toml")).context("reading pyproject.toml")?;

    let workflows_dir = config_dir.join("workflows");
    let mut workflows = Vec::new();
    if workflows_dir.is_dir() {
        for entry in std::fs::read_dir(&workflows_dir).context("reading workflows directory")? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                let bytes = std::fs::read(entry.path())?;
                let name = entry.file_name().to_string_lossy().into_owned();
                workflows.push((name, bytes));
            }
        }
    }

    let sources = infrastructure::ExportSources {
        manifest_json: &manifest_json,
        persistent_manifest_toml: &persistent_manifest_toml,
        workflows,
        dev_node_dirs: Vec::new(),
    };
    infrastructure::export(&sources, output).context("writing export archive")?;
    log::info!("exported environment to {}", output.display());
    Ok(())
}

fn run_import(archive: &std::path::Path, target_dir: &std::path::Path) -> Result<()> {
    infrastructure::import(archive, target_dir).context("extracting archive")?;
    log::info!("imported archive into {}", target_dir.display());
    Ok(())
}

fn run_resolve(
    config: &Config,
    manifest_path: &std::path::Path,
    workflow_name: &str,
    models_root: Option<PathBuf>,
    strategy: Option<StrategyArg>,
) -> Result<()> {
    let mut store = FileManifestStore::load(manifest_path).context("loading persistent manifest")?;
    let root = models_root.unwrap_or_else(|| config.models_root.clone());
    let index_path = config.cache_dir.join("model_index.json");
    let index = ModelIndex::load_or_default(&index_path).context("loading model index")?;
    index.scan(&root, |_| {}).context("scanning models root")?;
    let mut downloader = Downloader::new(root, config.credentials())?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message(format!("resolving {workflow_name}"));
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));

    let manifest = store.manifest_mut();
    let result = match strategy.unwrap_or(StrategyArg::Auto) {
        StrategyArg::Auto => resolve(
            workflow_name,
            manifest,
            &index,
            &mut AutoStrategy,
            &mut downloader,
            |m| store_manifest(manifest_path, m),
        ),
        StrategyArg::Interactive => resolve(
            workflow_name,
            manifest,
            &index,
            &mut InteractiveStrategy::new(),
            &mut downloader,
            |m| store_manifest(manifest_path, m),
        ),
        StrategyArg::Scripted { mapping_path } => {
            let mut scripted = ScriptedStrategy::load(&mapping_path).context("loading scripted mapping")?;
            resolve(
                workflow_name,
                manifest,
                &index,
                &mut scripted,
                &mut downloader,
                |m| store_manifest(manifest_path, m),
            )
        }
    }
    .context("resolving workflow references")?;

    spinner.finish_and_clear();
    log::info!(
        "resolved {}: {} reference(s), {} still unresolved",
        workflow_name,
        result.outcomes.len(),
        result.unresolved_count()
    );
    Ok(())
}

fn store_manifest(manifest_path: &std::path::Path, manifest: &comfydock_core::domain::Manifest) -> Result<(), String> {
    let mut fresh = FileManifestStore::new(manifest_path.to_path_buf(), manifest.meta.clone());
    *fresh.manifest_mut() = manifest.clone();
    fresh.save().map_err(|e| e.to_string())
}
