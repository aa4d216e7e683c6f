//! Git worktrees as per-issue working copies.
//!
//! Every pipeline works in its own worktree on its own branch, so agents for
//! different issues never share a checkout.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::store::validate_issue_id;

/// One line of `git status --porcelain=v1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// XY status code; `??` marks an untracked file.
    pub code: String,
    /// Path after any rename.
    pub path: String,
}

impl StatusEntry {
    pub fn parse(line: &str) -> Result<Self> {
        let (code, rest) = line
            .split_at_checked(2)
            .filter(|(_, rest)| rest.starts_with(' ') && rest.len() > 1)
            .ok_or_else(|| anyhow!("unexpected porcelain line: '{line}'"))?;
        let path = match rest.split_once(" -> ") {
            Some((_, renamed)) => renamed,
            None => rest,
        };
        Ok(Self {
            code: code.to_string(),
            path: path.trim().to_string(),
        })
    }
}

/// Working-copy provisioning for pipelines.
pub trait Workspace {
    /// Create the working copy for `issue` on `branch` and return its path.
    fn provision(&self, issue: &str, branch: &str) -> Result<PathBuf>;

    fn has_uncommitted_changes(&self, workdir: &Path) -> Result<bool>;

    fn remove(&self, workdir: &Path) -> Result<()>;
}

/// `git` invoked inside one directory.
#[derive(Debug, Clone)]
pub struct Git {
    dir: PathBuf,
}

impl Git {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Tracked changes and untracked files, one entry per path.
    pub fn status(&self) -> Result<Vec<StatusEntry>> {
        self.output(&["status", "--porcelain=v1", "--untracked-files=all"])?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(StatusEntry::parse)
            .collect()
    }

    pub fn has_branch(&self, branch: &str) -> Result<bool> {
        self.probe(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{branch}")])
    }

    /// Check out `branch` into a new worktree at `path`, creating the branch
    /// from HEAD if it does not exist yet.
    #[instrument(skip_all, fields(branch))]
    pub fn add_worktree(&self, path: &Path, branch: &str) -> Result<()> {
        let path = path.to_string_lossy();
        if self.has_branch(branch)? {
            debug!(branch, "reusing existing branch");
            self.output(&["worktree", "add", &path, branch])?;
        } else {
            self.output(&["worktree", "add", "-b", branch, &path])?;
        }
        Ok(())
    }

    pub fn remove_worktree(&self, path: &Path) -> Result<()> {
        self.output(&["worktree", "remove", "--force", &path.to_string_lossy()])?;
        Ok(())
    }

    /// Stdout of a command that must succeed.
    fn output(&self, args: &[&str]) -> Result<String> {
        let output = self.spawn(args)?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Exit status of a yes/no command.
    fn probe(&self, args: &[&str]) -> Result<bool> {
        Ok(self.spawn(args)?.status.success())
    }

    fn spawn(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .output()
            .with_context(|| format!("spawn git {} in {}", args.join(" "), self.dir.display()))
    }
}

/// One worktree per issue under the configured worktree directory.
#[derive(Debug, Clone)]
pub struct GitWorktrees {
    repo: Git,
    worktree_dir: PathBuf,
}

impl GitWorktrees {
    pub fn new(repo: impl Into<PathBuf>, worktree_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo: Git::new(repo),
            worktree_dir: worktree_dir.into(),
        }
    }
}

impl Workspace for GitWorktrees {
    #[instrument(skip_all, fields(issue, branch))]
    fn provision(&self, issue: &str, branch: &str) -> Result<PathBuf> {
        validate_issue_id(issue)?;
        fs::create_dir_all(&self.worktree_dir)
            .with_context(|| format!("create {}", self.worktree_dir.display()))?;
        // git resolves relative paths against the repository, not our cwd.
        let dir = fs::canonicalize(&self.worktree_dir)
            .with_context(|| format!("resolve {}", self.worktree_dir.display()))?;
        let path = dir.join(issue);
        if path.exists() {
            return Err(anyhow!("working copy {} already exists", path.display()));
        }
        self.repo
            .add_worktree(&path, branch)
            .with_context(|| format!("provision worktree for issue {issue}"))?;
        info!(path = %path.display(), "worktree provisioned");
        Ok(path)
    }

    fn has_uncommitted_changes(&self, workdir: &Path) -> Result<bool> {
        Ok(!Git::new(workdir).status()?.is_empty())
    }

    #[instrument(skip_all, fields(workdir = %workdir.display()))]
    fn remove(&self, workdir: &Path) -> Result<()> {
        if !workdir.exists() {
            warn!("working copy already gone");
            return Ok(());
        }
        self.repo.remove_worktree(workdir)?;
        info!("worktree removed");
        Ok(())
    }
}
