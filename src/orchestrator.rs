//! Poll-evaluate-report loop.
//!
//! One cycle discovers candidate changes, skips those whose current revision
//! was already evaluated, and runs every new revision through
//! build, isolate, filter and test before posting a verdict. A revision is
//! recorded in the state store only after its verdict was posted, so a crash
//! or failed post re-evaluates it on the next cycle.

use std::path::Path;
use std::sync::Arc;

use crate::config::{PacingConfig, VerifierConfig};
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::git::Git;
use crate::isolation::{IsolationBranch, PatchIsolation};
use crate::review::{Change, ChangeQuery, ReviewReporter, ReviewService, Revision, Verdict};
use crate::stack::{BuildUnit, StackBuilder};
use crate::state::StateStore;
use crate::suite::{Manifest, SuiteRunner};

/// Counters for one discovery cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Changes returned by the discovery query.
    pub discovered: usize,
    /// Changes evaluated and reported.
    pub evaluated: usize,
    /// Changes skipped because their revision was already evaluated.
    pub skipped: usize,
    /// Closed changes removed from the state store.
    pub forgotten: usize,
}

/// Drives the verification pipeline.
pub struct Orchestrator {
    service: Arc<dyn ReviewService>,
    reporter: ReviewReporter,
    stack: StackBuilder,
    isolation: PatchIsolation,
    suite: SuiteRunner,
    manifest: Manifest,
    state: StateStore,
    query: String,
    pacing: PacingConfig,
}

impl Orchestrator {
    /// Wires the pipeline from configuration.
    pub fn from_config(
        config: &VerifierConfig,
        work_dir: &Path,
        manifest: Manifest,
        state: StateStore,
        service: Arc<dyn ReviewService>,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let under_test = config
            .under_test()
            .ok_or_else(|| Error::Config("no unit is marked under_test".to_string()))?;

        let git = Git::new(runner.clone(), config.timeouts.git());
        let units = config
            .units
            .iter()
            .map(|unit| BuildUnit::from_config(unit, work_dir))
            .collect();

        let stack = StackBuilder::new(
            units,
            config.build.clone(),
            git.clone(),
            runner.clone(),
            config.timeouts.build(),
        );
        let isolation = PatchIsolation::new(
            git,
            work_dir.join(&under_test.name),
            config.base_branch.clone(),
            config.gerrit.project_url(),
            config.relevance.clone(),
        );
        let suite = SuiteRunner::new(
            runner,
            work_dir.to_path_buf(),
            &config.suite,
            config.timeouts.scenario(),
        );

        Ok(Self {
            reporter: ReviewReporter::new(service.clone(), config.gerrit.label.clone()),
            service,
            stack,
            isolation,
            suite,
            manifest,
            state,
            query: ChangeQuery::from_config(&config.gerrit).to_string(),
            pacing: config.pacing.clone(),
        })
    }

    /// The state store, for inspection.
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Runs cycles forever, sleeping the poll interval between them.
    /// Cycle errors are logged and the next cycle starts on schedule.
    pub async fn run_forever(&mut self) {
        tracing::info!(
            query = %self.query,
            poll_interval_secs = self.pacing.poll_interval_secs,
            scenarios = self.manifest.len(),
            "starting verification loop"
        );
        loop {
            match self.run_cycle().await {
                Ok(summary) => tracing::info!(
                    discovered = summary.discovered,
                    evaluated = summary.evaluated,
                    skipped = summary.skipped,
                    forgotten = summary.forgotten,
                    "cycle complete"
                ),
                Err(e) => tracing::error!(error = %e, "cycle aborted"),
            }
            tokio::time::sleep(self.pacing.poll_interval()).await;
        }
    }

    /// Runs one discovery cycle.
    ///
    /// The tree under test is first returned to the base branch; if that
    /// fails nothing is evaluated. Review server and state store errors end
    /// the cycle early; changes
    /// already reported in this cycle stay recorded.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary> {
        // A killed run can leave the tree on an isolation branch, where the
        // stack build would fail for every change.
        let recovered = self.isolation.recover().await?;
        if recovered > 0 {
            tracing::warn!(branches = recovered, "recovered tree from interrupted run");
        }

        let changes = self.service.query_changes(&self.query).await?;
        let mut summary = CycleSummary {
            discovered: changes.len(),
            ..CycleSummary::default()
        };
        tracing::info!(count = changes.len(), "discovered candidate changes");

        for change in &changes {
            let revision = match &change.revision {
                Some(revision) => revision.clone(),
                None => self.service.current_revision(change.number).await?,
            };

            if self.state.is_known(&change.change_id, &revision.fetch_ref) {
                if self.service.is_open(change.number).await? {
                    tracing::debug!(change_id = %change.change_id, "revision already evaluated");
                    summary.skipped += 1;
                } else {
                    tracing::info!(change_id = %change.change_id, "change closed, forgetting");
                    self.state.forget(&change.change_id);
                    self.state.persist()?;
                    summary.forgotten += 1;
                }
            } else {
                tracing::info!(
                    change_id = %change.change_id,
                    number = change.number,
                    fetch_ref = %revision.fetch_ref,
                    subject = %change.subject,
                    mergeable = ?change.mergeable,
                    "evaluating change"
                );
                let verdict = self.evaluate(change, &revision).await;

                self.reporter.report(change, &revision, &verdict).await?;
                self.state.remember(&change.change_id, &revision.fetch_ref);
                self.state.persist()?;
                summary.evaluated += 1;
            }

            tokio::time::sleep(self.pacing.change_interval()).await;
        }

        Ok(summary)
    }

    /// Produces the verdict for one revision. Infrastructure failures along
    /// the way become [`Verdict::BuildFailed`]; the isolation branch is
    /// always released before returning.
    async fn evaluate(&self, change: &Change, revision: &Revision) -> Verdict {
        if let Err(e) = self.stack.build_stack().await {
            tracing::warn!(change_id = %change.change_id, error = %e, "stack build failed");
            return Verdict::build_failed(e);
        }

        let mut branch = match self
            .isolation
            .isolate(&change.change_id, &revision.fetch_ref)
            .await
        {
            Ok(branch) => branch,
            Err(e) => {
                tracing::warn!(change_id = %change.change_id, error = %e, "patch isolation failed");
                return Verdict::build_failed(e);
            }
        };

        let verdict = self.verdict_on(&branch).await;

        if let Err(e) = branch.cleanup().await {
            tracing::error!(branch = %branch.name(), error = %e, "failed to release isolation branch");
        }
        verdict
    }

    async fn verdict_on(&self, branch: &IsolationBranch) -> Verdict {
        match branch.has_relevant_changes().await {
            Ok(true) => {}
            Ok(false) => return Verdict::NoRelevantChange,
            Err(e) => return Verdict::build_failed(e),
        }

        if let Err(e) = self.stack.build_patched().await {
            tracing::warn!(branch = %branch.name(), error = %e, "patched tree does not compile");
            return Verdict::build_failed(e);
        }

        match self.suite.run(&self.manifest).await {
            Ok(report) => {
                tracing::info!(
                    passed = report.passed(),
                    last_scenario = ?report.last_scenario(),
                    executed = report.executed.len(),
                    "suite finished"
                );
                report.verdict()
            }
            Err(e) => {
                tracing::error!(error = %e, "suite infrastructure failure");
                Verdict::build_failed(e)
            }
        }
    }
}
