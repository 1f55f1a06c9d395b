//! Layered dependency build.
//!
//! The stack is an ordered list of source trees (base library, service
//! daemon, component under test). Each unit is cloned on first use, pulled,
//! and rebuilt only when upstream moved or no previous build output exists.
//! Dependencies are installed system-wide so later units can link against
//! them; the component under test is built in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BuildToolConfig, UnitConfig};
use crate::error::{Error, Result};
use crate::exec::{CommandRunner, CommandSpec};
use crate::git::{Git, PullOutcome};

/// Output lines kept per stream of a build step.
const BUILD_OUTPUT_LINES: usize = 500;

/// Role of a unit within the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitRole {
    /// Library or daemon the component under test depends on.
    Dependency,
    /// The component whose patches are verified.
    UnderTest,
}

/// One source tree of the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildUnit {
    /// Short name, also the directory name.
    pub name: String,
    /// Remote used for the initial clone.
    pub origin: String,
    /// Local source tree.
    pub path: PathBuf,
    /// Dependency or component under test.
    pub role: UnitRole,
    /// Extra configure arguments.
    pub configure_args: Vec<String>,
}

impl BuildUnit {
    /// Builds a unit located at `<work_dir>/<name>`.
    pub fn from_config(config: &UnitConfig, work_dir: &Path) -> Self {
        Self {
            name: config.name.clone(),
            origin: config.origin.clone(),
            path: work_dir.join(&config.name),
            role: if config.under_test {
                UnitRole::UnderTest
            } else {
                UnitRole::Dependency
            },
            configure_args: config.configure_args.clone(),
        }
    }

    /// Returns true for the component under test.
    pub fn is_under_test(&self) -> bool {
        self.role == UnitRole::UnderTest
    }
}

/// What `build` did for a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    /// Nothing changed upstream and a previous build exists.
    UpToDate,
    /// The unit was reconfigured and compiled (and installed if a dependency).
    Rebuilt,
}

/// Drives the build tool over the stack.
pub struct StackBuilder {
    units: Vec<BuildUnit>,
    tool: BuildToolConfig,
    git: Git,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl StackBuilder {
    /// Creates a builder for `units` in dependency order.
    pub fn new(
        units: Vec<BuildUnit>,
        tool: BuildToolConfig,
        git: Git,
        runner: Arc<dyn CommandRunner>,
        timeout: Duration,
    ) -> Self {
        Self {
            units,
            tool,
            git,
            runner,
            timeout,
        }
    }

    /// Units in build order.
    pub fn units(&self) -> &[BuildUnit] {
        &self.units
    }

    /// The component under test, if configured.
    pub fn under_test(&self) -> Option<&BuildUnit> {
        self.units.iter().find(|u| u.is_under_test())
    }

    /// Builds every unit in order, stopping at the first failure.
    pub async fn build_stack(&self) -> Result<Vec<(String, BuildStatus)>> {
        let mut statuses = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let status = self.build(unit).await?;
            statuses.push((unit.name.clone(), status));
        }
        Ok(statuses)
    }

    /// Brings one unit to a built (and for dependencies, installed) state.
    pub async fn build(&self, unit: &BuildUnit) -> Result<BuildStatus> {
        if !unit.path.exists() {
            tracing::info!(unit = %unit.name, origin = %unit.origin, "cloning missing unit");
            self.git
                .clone_shallow(&unit.origin, &unit.path)
                .await
                .map_err(|e| build_error(unit, "clone", e.to_string()))?;
        }

        let pulled = self
            .git
            .pull(&unit.path)
            .await
            .map_err(|e| build_error(unit, "pull", e.to_string()))?;

        if pulled == PullOutcome::UpToDate && unit.path.join(&self.tool.output_dir).is_dir() {
            tracing::info!(unit = %unit.name, "unit up to date, skipping build");
            return Ok(BuildStatus::UpToDate);
        }

        tracing::info!(unit = %unit.name, pull = ?pulled, "rebuilding unit");
        self.compile(unit).await?;

        if !unit.is_under_test() {
            self.step(unit, "install", self.tool.install.clone(), self.tool.sudo_install)
                .await?;
        }

        tracing::info!(unit = %unit.name, "unit rebuilt");
        Ok(BuildStatus::Rebuilt)
    }

    /// Compiles the component under test as its tree currently stands.
    ///
    /// Used after a patch has been merged onto an isolation branch; no pull
    /// happens and nothing is installed.
    pub async fn build_patched(&self) -> Result<()> {
        let unit = self
            .under_test()
            .ok_or_else(|| Error::Config("no unit is marked under_test".to_string()))?;
        tracing::info!(unit = %unit.name, "compiling patched tree");
        self.compile(unit).await
    }

    /// Clean, configure and compile steps shared by every rebuild.
    async fn compile(&self, unit: &BuildUnit) -> Result<()> {
        self.step(unit, "clean", self.tool.clean.clone(), false)
            .await?;

        let mut configure = self.tool.configure.clone();
        configure.extend(unit.configure_args.iter().cloned());
        self.step(unit, "configure", configure, false).await?;

        self.step(unit, "compile", self.tool.compile.clone(), false)
            .await
    }

    /// Runs one build tool step inside the unit's tree.
    async fn step(
        &self,
        unit: &BuildUnit,
        step: &str,
        args: Vec<String>,
        sudo: bool,
    ) -> Result<()> {
        let program = self.program_for(unit);
        let command = if sudo {
            CommandSpec::new("sudo").arg(program).args(args)
        } else {
            CommandSpec::new(program).args(args)
        };
        let spec = command
            .current_dir(&unit.path)
            .timeout(self.timeout)
            .capture_lines(BUILD_OUTPUT_LINES);

        tracing::debug!(unit = %unit.name, step = %step, "running build step");
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| build_error(unit, step, e.to_string()))?;

        match output.failure_detail() {
            None => Ok(()),
            Some(detail) => Err(build_error(unit, step, detail)),
        }
    }

    /// Resolves a relative build tool path (`./waf`) against the unit's tree.
    fn program_for(&self, unit: &BuildUnit) -> String {
        let program = Path::new(&self.tool.program);
        if program.is_relative() && self.tool.program.contains('/') {
            unit.path.join(program).to_string_lossy().into_owned()
        } else {
            self.tool.program.clone()
        }
    }
}

fn build_error(unit: &BuildUnit, step: &str, detail: String) -> Error {
    Error::Build {
        unit: unit.name.clone(),
        step: step.to_string(),
        detail,
    }
}
