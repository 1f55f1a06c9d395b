//! Git operations used by the build stack and patch isolation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::exec::{CommandOutput, CommandRunner, CommandSpec};

/// Identity used for merge commits created while applying a patch.
const MERGE_IDENTITY: [&str; 4] = [
    "-c",
    "user.name=patch-verifier",
    "-c",
    "user.email=patch-verifier@localhost",
];

/// Result of pulling upstream changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// Nothing new upstream.
    UpToDate,
    /// New commits were merged into the working tree.
    Updated,
}

/// One entry of `git diff --name-status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedPath {
    /// Status letter (`A`, `M`, `D`, `R`, `C`, ...).
    pub status: char,
    /// Path after the change.
    pub path: PathBuf,
    /// Source path for renames and copies.
    pub old_path: Option<PathBuf>,
}

impl ChangedPath {
    /// All paths touched by this entry.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.path.as_path()).chain(self.old_path.as_deref())
    }
}

/// Parses `git diff --name-status` output.
pub fn parse_name_status(output: &str) -> Vec<ChangedPath> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let mut parts = line.split('\t');
            let status = parts.next()?.chars().next()?;
            let first = parts.next()?;
            match parts.next() {
                Some(second) => Some(ChangedPath {
                    status,
                    path: PathBuf::from(second),
                    old_path: Some(PathBuf::from(first)),
                }),
                None => Some(ChangedPath {
                    status,
                    path: PathBuf::from(first),
                    old_path: None,
                }),
            }
        })
        .collect()
}

/// Git client bound to a command runner and a per-invocation timeout.
#[derive(Clone)]
pub struct Git {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl Git {
    /// Creates a git client.
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    fn command(&self, repo: &Path) -> CommandSpec {
        CommandSpec::new("git")
            .current_dir(repo)
            .timeout(self.timeout)
            // Stable English messages for output matching.
            .env("LC_ALL", "C")
    }

    async fn run_checked(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let output = self.runner.run(&spec).await?;
        match output.failure_detail() {
            None => Ok(output),
            Some(detail) => Err(Error::Git(format!("{}: {}", spec.command_line(), detail))),
        }
    }

    /// Shallow-clones `origin` into `dest`.
    pub async fn clone_shallow(&self, origin: &str, dest: &Path) -> Result<()> {
        let name = dest
            .file_name()
            .ok_or_else(|| Error::Git(format!("invalid clone destination {}", dest.display())))?;
        let parent = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let spec = self
            .command(&parent)
            .args(["clone", "--depth", "1", origin])
            .arg(name.to_string_lossy());
        self.run_checked(spec).await?;

        tracing::info!(origin = %origin, dest = ?dest, "cloned repository");
        Ok(())
    }

    /// Pulls upstream changes into the current branch.
    pub async fn pull(&self, repo: &Path) -> Result<PullOutcome> {
        let output = self
            .run_checked(self.command(repo).args(["pull", "--ff-only"]))
            .await?;
        let text = output.stdout.to_lowercase();
        if text.contains("already up to date") || text.contains("already up-to-date") {
            Ok(PullOutcome::UpToDate)
        } else {
            Ok(PullOutcome::Updated)
        }
    }

    /// Checks out an existing branch.
    pub async fn checkout(&self, repo: &Path, branch: &str) -> Result<()> {
        self.run_checked(self.command(repo).args(["checkout", branch]))
            .await?;
        Ok(())
    }

    /// Checks out `branch`, discarding local modifications to tracked files.
    pub async fn checkout_force(&self, repo: &Path, branch: &str) -> Result<()> {
        self.run_checked(self.command(repo).args(["checkout", "-f", branch]))
            .await?;
        Ok(())
    }

    /// Names of all local branches.
    pub async fn local_branches(&self, repo: &Path) -> Result<Vec<String>> {
        let output = self
            .run_checked(self.command(repo).args([
                "for-each-ref",
                "--format=%(refname:short)",
                "refs/heads/",
            ]))
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect())
    }

    /// Creates `branch` at HEAD and checks it out.
    pub async fn create_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.run_checked(self.command(repo).args(["checkout", "-b", branch]))
            .await?;
        Ok(())
    }

    /// Force-deletes a local branch.
    pub async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.run_checked(self.command(repo).args(["branch", "-D", branch]))
            .await?;
        Ok(())
    }

    /// Returns true if a local branch with this name exists.
    pub async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let spec = self
            .command(repo)
            .args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("refs/heads/{}", branch));
        let output = self.runner.run(&spec).await?;
        Ok(output.success())
    }

    /// Fetches `refspec` from `url` and merges it into the current branch.
    pub async fn fetch_and_merge(&self, repo: &Path, url: &str, refspec: &str) -> Result<()> {
        self.run_checked(self.command(repo).args(["fetch", url, refspec]))
            .await?;
        self.run_checked(
            self.command(repo)
                .args(MERGE_IDENTITY)
                .args(["merge", "--no-edit", "FETCH_HEAD"]),
        )
        .await?;
        Ok(())
    }

    /// Aborts an in-progress merge, ignoring failure when none is active.
    pub async fn abort_merge(&self, repo: &Path) -> Result<()> {
        self.runner
            .run(&self.command(repo).args(["merge", "--abort"]))
            .await?;
        Ok(())
    }

    /// Lists paths changed between `from` and `to`.
    pub async fn changed_paths(&self, repo: &Path, from: &str, to: &str) -> Result<Vec<ChangedPath>> {
        let output = self
            .run_checked(self.command(repo).args(["diff", "--name-status", from, to]))
            .await?;
        Ok(parse_name_status(&output.stdout))
    }
}
