//! Isolation branches in the component-under-test's working tree.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};
use crate::git::{ChangedPath, Git};

use super::relevance::RelevancePolicy;

/// Materializes patches from the review server on disposable branches.
pub struct PatchIsolation {
    git: Git,
    /// Working tree of the component under test.
    repo_path: PathBuf,
    /// Branch returned to after each change.
    base_branch: String,
    /// Git URL of the project on the review server.
    review_url: String,
    policy: RelevancePolicy,
}

impl PatchIsolation {
    /// Creates an isolation provider for the tree at `repo_path`.
    pub fn new(
        git: Git,
        repo_path: PathBuf,
        base_branch: impl Into<String>,
        review_url: impl Into<String>,
        policy: RelevancePolicy,
    ) -> Self {
        Self {
            git,
            repo_path,
            base_branch: base_branch.into(),
            review_url: review_url.into(),
            policy,
        }
    }

    /// Returns the path of the working tree.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Returns the tree to the base branch after an interrupted run.
    ///
    /// Aborts any half-done merge, force-checks-out the base branch and
    /// deletes every leftover isolation branch. A tree that has not been
    /// cloned yet needs nothing. Returns the number of branches removed.
    pub async fn recover(&self) -> Result<usize> {
        if !self.repo_path.join(".git").exists() {
            return Ok(0);
        }

        if let Err(e) = self.git.abort_merge(&self.repo_path).await {
            tracing::debug!(error = %e, "merge abort failed");
        }
        self.git
            .checkout_force(&self.repo_path, &self.base_branch)
            .await
            .map_err(isolation_error)?;

        let leftovers: Vec<String> = self
            .git
            .local_branches(&self.repo_path)
            .await
            .map_err(isolation_error)?
            .into_iter()
            .filter(|name| name != &self.base_branch && is_isolation_branch(name))
            .collect();
        for branch in &leftovers {
            tracing::warn!(branch = %branch, "removing leftover isolation branch");
            self.git
                .delete_branch(&self.repo_path, branch)
                .await
                .map_err(isolation_error)?;
        }
        Ok(leftovers.len())
    }

    /// Creates a branch named after `change_id` and merges `fetch_ref` into it.
    ///
    /// On failure the branch is already released; on success the caller owns
    /// the returned guard and must call [`IsolationBranch::cleanup`].
    pub async fn isolate(&self, change_id: &str, fetch_ref: &str) -> Result<IsolationBranch> {
        let branch = branch_name_for(change_id);

        // A crash between isolate and cleanup leaves the branch behind.
        let stale = self
            .git
            .branch_exists(&self.repo_path, &branch)
            .await
            .map_err(isolation_error)?;
        if stale {
            tracing::warn!(branch = %branch, "removing stale isolation branch");
            self.git
                .checkout(&self.repo_path, &self.base_branch)
                .await
                .map_err(isolation_error)?;
            self.git
                .delete_branch(&self.repo_path, &branch)
                .await
                .map_err(isolation_error)?;
        }

        self.git
            .create_branch(&self.repo_path, &branch)
            .await
            .map_err(isolation_error)?;

        let mut guard = IsolationBranch {
            git: self.git.clone(),
            repo_path: self.repo_path.clone(),
            base_branch: self.base_branch.clone(),
            branch,
            policy: self.policy.clone(),
            released: false,
        };

        if let Err(e) = self
            .git
            .fetch_and_merge(&self.repo_path, &self.review_url, fetch_ref)
            .await
        {
            tracing::warn!(branch = %guard.branch, fetch_ref = %fetch_ref, error = %e, "failed to apply patch");
            if let Err(abort) = self.git.abort_merge(&self.repo_path).await {
                tracing::debug!(error = %abort, "merge abort failed");
            }
            if let Err(cleanup) = guard.cleanup().await {
                tracing::error!(error = %cleanup, "failed to release isolation branch");
            }
            return Err(isolation_error(e));
        }

        tracing::info!(branch = %guard.branch, fetch_ref = %fetch_ref, "patch applied on isolation branch");
        Ok(guard)
    }
}

/// A checked-out isolation branch holding one patch.
///
/// Released by [`cleanup`](Self::cleanup); if dropped unreleased, cleanup
/// runs synchronously.
pub struct IsolationBranch {
    git: Git,
    repo_path: PathBuf,
    base_branch: String,
    branch: String,
    policy: RelevancePolicy,
    released: bool,
}

impl IsolationBranch {
    /// Name of the isolation branch.
    pub fn name(&self) -> &str {
        &self.branch
    }

    /// Paths changed by the patch (branch tip against its parent).
    pub async fn changed_paths(&self) -> Result<Vec<ChangedPath>> {
        self.git
            .changed_paths(&self.repo_path, "HEAD~1", "HEAD")
            .await
            .map_err(isolation_error)
    }

    /// Returns true if the patch touches compiled sources or build files.
    pub async fn has_relevant_changes(&self) -> Result<bool> {
        let changes = self.changed_paths().await?;
        let relevant = self.policy.any_relevant(&changes);
        tracing::info!(
            branch = %self.branch,
            changed = changes.len(),
            relevant,
            "classified patch"
        );
        Ok(relevant)
    }

    /// Checks out the base branch and force-deletes the isolation branch.
    pub async fn cleanup(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }

        self.git
            .checkout(&self.repo_path, &self.base_branch)
            .await
            .map_err(isolation_error)?;
        self.git
            .delete_branch(&self.repo_path, &self.branch)
            .await
            .map_err(isolation_error)?;

        self.released = true;
        tracing::debug!(branch = %self.branch, "released isolation branch");
        Ok(())
    }

    fn cleanup_blocking(&mut self) -> std::io::Result<()> {
        for args in [
            vec!["checkout", "-f", self.base_branch.as_str()],
            vec!["branch", "-D", self.branch.as_str()],
        ] {
            let output = Command::new("git")
                .current_dir(&self.repo_path)
                .args(&args)
                .output()?;
            if !output.status.success() {
                return Err(std::io::Error::other(
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                ));
            }
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for IsolationBranch {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.cleanup_blocking() {
                tracing::error!(error = %e, branch = %self.branch, "failed to release isolation branch on drop");
            }
        }
    }
}

/// Maps a change-id to a safe branch name.
pub fn branch_name_for(change_id: &str) -> String {
    let name: String = change_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if name.is_empty() {
        "unnamed-change".to_string()
    } else {
        name
    }
}

/// Change-ids are `I` followed by hex digits.
fn is_isolation_branch(name: &str) -> bool {
    name.strip_prefix('I')
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_hexdigit()))
}

fn isolation_error(e: Error) -> Error {
    match e {
        Error::Isolation(_) => e,
        other => Error::Isolation(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::SystemRunner;
    use crate::git::test_repo::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const CHANGE_ID: &str = "I0123456789abcdef0123456789abcdef01234567";
    const PATCH_REF: &str = "refs/changes/67/4567/2";

    /// Review server repository plus a clone acting as the tree under test.
    struct Fixture {
        review: TempDir,
        work: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let review = create_temp_git_repo();
            let work = TempDir::new().unwrap();
            git(
                work.path(),
                &["clone", &review.path().to_string_lossy(), "NLSR"],
            );
            let tree = work.path().join("NLSR");
            git(&tree, &["config", "user.email", "test@test.com"]);
            git(&tree, &["config", "user.name", "Test User"]);
            Self { review, work }
        }

        fn tree(&self) -> PathBuf {
            self.work.path().join("NLSR")
        }

        /// Publishes a patch with `files` under `PATCH_REF` on the review repo.
        fn publish_patch(&self, files: &[(&str, &str)]) {
            let review = self.review.path();
            git(review, &["checkout", "-b", "patch"]);
            commit_files(review, files, "Patch under review");
            git(review, &["update-ref", PATCH_REF, "HEAD"]);
            git(review, &["checkout", "master"]);
        }

        fn isolation(&self) -> PatchIsolation {
            let git = Git::new(Arc::new(SystemRunner::new()), Duration::from_secs(30));
            PatchIsolation::new(
                git,
                self.tree(),
                "master",
                self.review.path().to_string_lossy(),
                RelevancePolicy::default(),
            )
        }

        fn branches(&self) -> String {
            git(&self.tree(), &["branch", "--list"])
        }
    }

    #[tokio::test]
    async fn isolate_applies_patch_on_new_branch() {
        let fixture = Fixture::new();
        fixture.publish_patch(&[("src/lsdb.cpp", "// fix\n")]);

        let mut branch = fixture.isolation().isolate(CHANGE_ID, PATCH_REF).await.unwrap();

        assert_eq!(current_branch(&fixture.tree()), CHANGE_ID);
        assert!(fixture.tree().join("src/lsdb.cpp").exists());
        assert!(branch.has_relevant_changes().await.unwrap());

        branch.cleanup().await.unwrap();
        assert_eq!(current_branch(&fixture.tree()), "master");
        assert!(!fixture.branches().contains(CHANGE_ID));
        assert!(!fixture.tree().join("src/lsdb.cpp").exists());
    }

    #[tokio::test]
    async fn docs_only_patch_is_not_relevant() {
        let fixture = Fixture::new();
        fixture.publish_patch(&[("docs/INSTALL.rst", "steps\n"), ("README.md", "more\n")]);

        let mut branch = fixture.isolation().isolate(CHANGE_ID, PATCH_REF).await.unwrap();
        let changes = branch.changed_paths().await.unwrap();

        assert_eq!(changes.len(), 2);
        assert!(!branch.has_relevant_changes().await.unwrap());
        branch.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn failed_fetch_releases_branch() {
        let fixture = Fixture::new();

        let err = fixture
            .isolation()
            .isolate(CHANGE_ID, "refs/changes/00/0/1")
            .await
            .err()
            .expect("fetch of unknown ref should fail");

        assert!(matches!(err, Error::Isolation(_)));
        assert_eq!(current_branch(&fixture.tree()), "master");
        assert!(!fixture.branches().contains(CHANGE_ID));
    }

    #[tokio::test]
    async fn stale_branch_from_previous_run_is_replaced() {
        let fixture = Fixture::new();
        fixture.publish_patch(&[("src/route.hpp", "// fix\n")]);
        git(&fixture.tree(), &["branch", CHANGE_ID]);

        let mut branch = fixture.isolation().isolate(CHANGE_ID, PATCH_REF).await.unwrap();
        assert_eq!(current_branch(&fixture.tree()), CHANGE_ID);
        assert!(fixture.tree().join("src/route.hpp").exists());
        branch.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let fixture = Fixture::new();
        fixture.publish_patch(&[("src/a.cpp", "x\n")]);

        let mut branch = fixture.isolation().isolate(CHANGE_ID, PATCH_REF).await.unwrap();
        branch.cleanup().await.expect("first cleanup failed");
        branch
            .cleanup()
            .await
            .expect("second cleanup should be idempotent");
    }

    #[tokio::test]
    async fn dropping_unreleased_branch_cleans_up() {
        let fixture = Fixture::new();
        fixture.publish_patch(&[("src/a.cpp", "x\n")]);

        let branch = fixture.isolation().isolate(CHANGE_ID, PATCH_REF).await.unwrap();
        assert_eq!(branch.name(), CHANGE_ID);
        drop(branch);

        assert_eq!(current_branch(&fixture.tree()), "master");
        assert!(!fixture.branches().contains(CHANGE_ID));
    }

    #[tokio::test]
    async fn recover_returns_interrupted_tree_to_base() {
        let fixture = Fixture::new();
        let tree = fixture.tree();
        git(&tree, &["checkout", "-b", CHANGE_ID]);
        commit_files(&tree, &[("src/half.cpp", "x\n")], "interrupted patch");
        std::fs::write(tree.join("README.md"), "dirty\n").unwrap();
        git(&tree, &["branch", "feature-kept"]);

        let removed = fixture.isolation().recover().await.unwrap();

        assert_eq!(removed, 1);
        assert_eq!(current_branch(&tree), "master");
        assert!(!fixture.branches().contains(CHANGE_ID));
        assert!(fixture.branches().contains("feature-kept"));
        assert!(!tree.join("src/half.cpp").exists());
        assert_ne!(std::fs::read_to_string(tree.join("README.md")).unwrap(), "dirty\n");
    }

    #[tokio::test]
    async fn recover_on_clean_or_missing_tree_is_noop() {
        let fixture = Fixture::new();
        assert_eq!(fixture.isolation().recover().await.unwrap(), 0);
        assert_eq!(current_branch(&fixture.tree()), "master");

        let missing = PatchIsolation::new(
            Git::new(Arc::new(SystemRunner::new()), Duration::from_secs(30)),
            fixture.work.path().join("not-cloned-yet"),
            "master",
            "unused",
            RelevancePolicy::default(),
        );
        assert_eq!(missing.recover().await.unwrap(), 0);
    }

    #[test]
    fn only_change_id_branches_are_isolation_branches() {
        assert!(is_isolation_branch(CHANGE_ID));
        assert!(is_isolation_branch("I4567"));
        assert!(!is_isolation_branch("I"));
        assert!(!is_isolation_branch("master"));
        assert!(!is_isolation_branch("Iteration-2"));
    }

    #[test]
    fn branch_names_are_sanitized() {
        assert_eq!(branch_name_for(CHANGE_ID), CHANGE_ID);
        assert_eq!(branch_name_for("NLSR~master~I12"), "NLSR-master-I12");
        assert_eq!(branch_name_for(""), "unnamed-change");
    }
}
