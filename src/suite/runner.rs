//! Sequential, fail-fast execution of manifest scenarios.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SuiteConfig;
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec, ExitOutcome};
use crate::review::Verdict;

use super::manifest::{Manifest, TestScenario};

/// Output lines kept per stream of a scenario. Emulation runs are chatty
/// and only the end matters for a failure report.
const SCENARIO_OUTPUT_LINES: usize = 1000;

/// Result of one executed scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioRun {
    pub name: String,
    pub outcome: ExitOutcome,
    pub duration: Duration,
}

/// What happened across a suite run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuiteReport {
    /// Scenarios that ran, in order. The last one may be the failure.
    pub executed: Vec<ScenarioRun>,
    /// Name of the scenario that failed, if any.
    pub failed: Option<String>,
}

impl SuiteReport {
    /// Name of the last scenario that ran, `None` for an empty manifest.
    pub fn last_scenario(&self) -> Option<&str> {
        self.executed.last().map(|run| run.name.as_str())
    }

    pub fn passed(&self) -> bool {
        self.failed.is_none()
    }

    /// Converts the report into a verdict.
    pub fn verdict(&self) -> Verdict {
        match &self.failed {
            Some(name) => Verdict::ScenarioFailed { name: name.clone() },
            None => Verdict::AllPassed {
                scenarios: self.executed.iter().map(|run| run.name.clone()).collect(),
            },
        }
    }
}

/// Runs scenarios against the built stack.
pub struct SuiteRunner {
    runner: Arc<dyn CommandRunner>,
    /// Directory the scenarios run from.
    work_dir: PathBuf,
    /// Emulator output area, emptied around every scenario.
    scratch_root: PathBuf,
    failure_exit_code: i32,
    timeout: Duration,
}

impl SuiteRunner {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        work_dir: PathBuf,
        config: &SuiteConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            work_dir,
            scratch_root: PathBuf::from(&config.scratch_root),
            failure_exit_code: config.failure_exit_code,
            timeout,
        }
    }

    /// Runs every scenario in order, stopping at the first failure.
    ///
    /// Errors are infrastructure problems (scratch area not writable,
    /// program not launchable), not test failures.
    pub async fn run(&self, manifest: &Manifest) -> Result<SuiteReport> {
        let mut report = SuiteReport::default();

        for scenario in manifest.scenarios() {
            clear_scratch(&self.scratch_root)?;
            let run = self.run_scenario(scenario).await;
            clear_scratch(&self.scratch_root)?;
            let run = run?;

            let failed = self.is_failure(run.outcome);
            if failed {
                tracing::warn!(scenario = %run.name, outcome = %run.outcome, "scenario failed");
            } else {
                tracing::info!(
                    scenario = %run.name,
                    outcome = %run.outcome,
                    duration_secs = run.duration.as_secs(),
                    "scenario passed"
                );
            }

            report.executed.push(run);
            if failed {
                report.failed = Some(scenario.name.clone());
                break;
            }
        }

        Ok(report)
    }

    async fn run_scenario(&self, scenario: &TestScenario) -> Result<ScenarioRun> {
        let spec = CommandSpec::from_argv(&scenario.argv)
            .ok_or_else(|| Error::Config(format!("scenario '{}' has no command", scenario.name)))?
            .current_dir(&self.work_dir)
            .timeout(self.timeout)
            .capture_lines(SCENARIO_OUTPUT_LINES);

        tracing::info!(scenario = %scenario.name, command = %spec.command_line(), "running scenario");
        let output = self.runner.run(&spec).await?;
        if let Some(detail) = output.failure_detail() {
            tracing::debug!(scenario = %scenario.name, detail = %detail, "scenario output");
        }

        Ok(ScenarioRun {
            name: scenario.name.clone(),
            outcome: output.outcome,
            duration: output.duration,
        })
    }

    /// Only the designated failure code counts as a failed scenario; a
    /// scenario killed by a signal or its timeout never completed and fails
    /// too. Other exit codes are logged and treated as passes.
    fn is_failure(&self, outcome: ExitOutcome) -> bool {
        match outcome {
            ExitOutcome::Exited(code) if code == self.failure_exit_code => true,
            ExitOutcome::Exited(0) => false,
            ExitOutcome::Exited(code) => {
                tracing::warn!(code, "scenario exited with unexpected code, not counted as failure");
                false
            }
            ExitOutcome::Signaled | ExitOutcome::TimedOut => true,
        }
    }
}

/// Removes every non-hidden entry under `root`, creating it if missing.
/// Returns the number of entries removed.
pub fn clear_scratch(root: &Path) -> Result<usize> {
    std::fs::create_dir_all(root)?;

    let mut removed = 0;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        // file_type does not follow symlinks, so a linked directory is unlinked.
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        removed += 1;
    }

    if removed > 0 {
        tracing::debug!(root = ?root, removed, "cleared scratch area");
    }
    Ok(removed)
}
