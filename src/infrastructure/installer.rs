//! Thin `uv`-shelling collaborator for the Python dependency surface of an
//! environment (`spec.md` §6.2).

use std::path::Path;
use std::process::{Command, Output};

use thiserror::Error;

/// Errors raised invoking `uv`.
#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("uv executable not found on PATH")]
    NotFound(#[source] std::io::Error),

    #[error("uv {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

/// Dependency group a specifier belongs to, mirroring `uv`'s
/// `--group`/default split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyGroup {
    Default,
    Named(&'static str),
}

/// Everything the finalizer and environment commands need from the Python
/// dependency manager, expressed as a port so callers can be tested
/// against a fake.
pub trait PythonInstaller {
    /// # Errors
    /// Returns [`InstallerError`] if the sync fails (unresolvable
    /// requirement, network failure reaching the package index, ...).
    fn sync_project(&self, manifest_path: &Path, verbose: bool) -> Result<(), InstallerError>;

    fn add(&self, project_dir: &Path, specifier: &str, group: DependencyGroup) -> Result<(), InstallerError>;

    fn remove(&self, project_dir: &Path, specifier: &str, group: DependencyGroup) -> Result<(), InstallerError>;

    fn list(&self, project_dir: &Path, group: Option<DependencyGroup>) -> Result<Vec<String>, InstallerError>;

    fn lock(&self, project_dir: &Path) -> Result<(), InstallerError>;

    fn has_uncommitted_changes(&self, project_dir: &Path) -> Result<bool, InstallerError>;
}

/// Shells out to the system `uv` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct UvInstaller;

impl UvInstaller {
    fn run_ok(&self, dir: &Path, args: &[&str]) -> Result<Output, InstallerError> {
        let output = Command::new("uv")
            .current_dir(dir)
            .args(args)
            .output()
            .map_err(InstallerError::NotFound)?;
        if output.status.success() {
            return Ok(output);
        }
        Err(InstallerError::Failed {
            command: args.join(" "),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

impl PythonInstaller for UvInstaller {
    fn sync_project(&self, manifest_path: &Path, verbose: bool) -> Result<(), InstallerError> {
        let dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        let mut args = vec!["sync"];
        if verbose {
            args.push("--verbose");
        }
        self.run_ok(dir, &args)?;
        Ok(())
    }

    fn add(&self, project_dir: &Path, specifier: &str, group: DependencyGroup) -> Result<(), InstallerError> {
        let mut args = vec!["add"];
        if let DependencyGroup::Named(name) = group {
            args.push("--group");
            args.push(name);
        }
        args.push(specifier);
        self.run_ok(project_dir, &args)?;
        Ok(())
    }

    fn remove(&self, project_dir: &Path, specifier: &str, group: DependencyGroup) -> Result<(), InstallerError> {
        let mut args = vec!["remove"];
        if let DependencyGroup::Named(name) = group {
            args.push("--group");
            args.push(name);
        }
        args.push(specifier);
        self.run_ok(project_dir, &args)?;
        Ok(())
    }

    fn list(&self, project_dir: &Path, group: Option<DependencyGroup>) -> Result<Vec<String>, InstallerError> {
        let mut args = vec!["pip", "list", "--format", "freeze"];
        if let Some(DependencyGroup::Named(name)) = group {
            args.push("--group");
            args.push(name);
        }
        let output = self.run_ok(project_dir, &args)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn lock(&self, project_dir: &Path) -> Result<(), InstallerError> {
        self.run_ok(project_dir, &["lock"])?;
        Ok(())
    }

    fn has_uncommitted_changes(&self, project_dir: &Path) -> Result<bool, InstallerError> {
        match self.run_ok(project_dir, &["lock", "--check"]) {
            Ok(_) => Ok(false),
            Err(InstallerError::Failed { .. }) => Ok(true),
            Err(err @ InstallerError::NotFound(_)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_group_distinguishes_default_from_named() {
        assert_ne!(DependencyGroup::Default, DependencyGroup::Named("dev"));
        assert_eq!(DependencyGroup::Named("dev"), DependencyGroup::Named("dev"));
    }
}
