//! Thin `git`-shelling collaborator used by the finalizer's clone step and
//! by environment-level version control operations (`spec.md` §6.3).

use std::path::Path;
use std::process::{Command, Output};

use thiserror::Error;

/// Errors raised invoking `git`, classified the way `spec.md` §7 groups
/// transport/auth/conflict failures.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git executable not found on PATH")]
    NotFound(#[source] std::io::Error),

    #[error("authentication required for {url}")]
    AuthenticationRequired { url: String },

    #[error("remote '{0}' not found")]
    RemoteNotFound(String),

    #[error("merge conflict merging '{reference}'")]
    Conflict { reference: String },

    #[error("git {command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

/// Everything the finalizer and environment commands need from git,
/// expressed as a port so callers can be tested against a fake.
pub trait GitCollaborator {
    /// # Errors
    /// Returns [`GitError`] on auth failure, transport failure, or if the
    /// ref does not exist.
    fn clone_repo(
        &self,
        url: &str,
        target: &Path,
        reference: Option<&str>,
        depth: Option<u32>,
    ) -> Result<(), GitError>;

    /// # Errors
    /// Returns [`GitError::Failed`] if `dir` is already a repository.
    fn init(&self, dir: &Path) -> Result<(), GitError>;

    fn add_all(&self, dir: &Path) -> Result<(), GitError>;

    fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError>;

    fn rev_parse(&self, dir: &Path, reference: &str) -> Result<String, GitError>;

    fn current_branch(&self, dir: &Path) -> Result<String, GitError>;

    fn fetch(&self, dir: &Path, remote: &str) -> Result<(), GitError>;

    /// # Errors
    /// Returns [`GitError::Conflict`] if a fast-forward merge isn't
    /// possible and `ff_only` was requested.
    fn merge(&self, dir: &Path, reference: &str, ff_only: bool) -> Result<(), GitError>;

    fn push(&self, dir: &Path, remote: &str, branch: &str) -> Result<(), GitError>;

    fn remote_add(&self, dir: &Path, name: &str, url: &str) -> Result<(), GitError>;

    fn remote_remove(&self, dir: &Path, name: &str) -> Result<(), GitError>;

    fn remote_list(&self, dir: &Path) -> Result<Vec<String>, GitError>;

    fn remote_get_url(&self, dir: &Path, name: &str) -> Result<String, GitError>;

    fn reset_hard(&self, dir: &Path, commit: &str) -> Result<(), GitError>;
}

/// Shells out to the system `git` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGit;

impl SystemGit {
    fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<Output, GitError> {
        let mut command = Command::new("git");
        if let Some(dir) = dir {
            command.current_dir(dir);
        }
        command.args(args);
        command.output().map_err(GitError::NotFound)
    }

    fn run_ok(&self, dir: Option<&Path>, args: &[&str]) -> Result<Output, GitError> {
        let output = self.run(dir, args)?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Err(classify_failure(args, &stderr))
    }
}

fn classify_failure(args: &[&str], stderr: &str) -> GitError {
    let lower = stderr.to_lowercase();
    if lower.contains("authentication failed") || lower.contains("permission denied") {
        return GitError::AuthenticationRequired {
            url: args.last().unwrap_or(&"").to_string(),
        };
    }
    if lower.contains("could not find remote") || lower.contains("does not appear to be a git repository") {
        return GitError::RemoteNotFound(args.last().unwrap_or(&"").to_string());
    }
    if lower.contains("conflict") || lower.contains("not possible to fast-forward") {
        return GitError::Conflict {
            reference: args.last().unwrap_or(&"").to_string(),
        };
    }
    GitError::Failed {
        command: args.join(" "),
        stderr: stderr.to_string(),
    }
}

impl GitCollaborator for SystemGit {
    fn clone_repo(
        &self,
        url: &str,
        target: &Path,
        reference: Option<&str>,
        depth: Option<u32>,
    ) -> Result<(), GitError> {
        let target_str = target.to_string_lossy().into_owned();
        let depth_str = depth.map(|d| d.to_string());
        let mut args: Vec<&str> = vec!["clone"];
        if let Some(depth) = &depth_str {
            args.push("--depth");
            args.push(depth);
        }
        if let Some(reference) = reference {
            args.push("--branch");
            args.push(reference);
        }
        args.push(url);
        args.push(&target_str);
        self.run_ok(None, &args)?;
        Ok(())
    }

    fn init(&self, dir: &Path) -> Result<(), GitError> {
        std::fs::create_dir_all(dir).map_err(|source| GitError::Failed {
            command: "init".to_string(),
            stderr: source.to_string(),
        })?;
        self.run_ok(Some(dir), &["init"])?;
        Ok(())
    }

    fn add_all(&self, dir: &Path) -> Result<(), GitError> {
        self.run_ok(Some(dir), &["add", "-A"])?;
        Ok(())
    }

    fn commit(&self, dir: &Path, message: &str) -> Result<(), GitError> {
        self.run_ok(Some(dir), &["commit", "-m", message])?;
        Ok(())
    }

    fn rev_parse(&self, dir: &Path, reference: &str) -> Result<String, GitError> {
        let output = self.run_ok(Some(dir), &["rev-parse", reference])?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn current_branch(&self, dir: &Path) -> Result<String, GitError> {
        let output = self.run_ok(Some(dir), &["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn fetch(&self, dir: &Path, remote: &str) -> Result<(), GitError> {
        self.run_ok(Some(dir), &["fetch", remote])?;
        Ok(())
    }

    fn merge(&self, dir: &Path, reference: &str, ff_only: bool) -> Result<(), GitError> {
        let mut args = vec!["merge"];
        if ff_only {
            args.push("--ff-only");
        }
        args.push(reference);
        self.run_ok(Some(dir), &args)?;
        Ok(())
    }

    fn push(&self, dir: &Path, remote: &str, branch: &str) -> Result<(), GitError> {
        self.run_ok(Some(dir), &["push", remote, branch])?;
        Ok(())
    }

    fn remote_add(&self, dir: &Path, name: &str, url: &str) -> Result<(), GitError> {
        self.run_ok(Some(dir), &["remote", "add", name, url])?;
        Ok(())
    }

    fn remote_remove(&self, dir: &Path, name: &str) -> Result<(), GitError> {
        self.run_ok(Some(dir), &["remote", "remove", name])?;
        Ok(())
    }

    fn remote_list(&self, dir: &Path) -> Result<Vec<String>, GitError> {
        let output = self.run_ok(Some(dir), &["remote"])?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }

    fn remote_get_url(&self, dir: &Path, name: &str) -> Result<String, GitError> {
        let output = self.run_ok(Some(dir), &["remote", "get-url", name])?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn reset_hard(&self, dir: &Path, commit: &str) -> Result<(), GitError> {
        self.run_ok(Some(dir), &["reset", "--hard", commit])?;
        Ok(())
    }
}

/// Check if a string is a full commit SHA (40 hexadecimal characters).
#[must_use]
pub fn is_commit_sha(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}
