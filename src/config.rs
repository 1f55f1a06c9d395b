//! Verifier configuration and validation.
//!
//! Configuration is read from an optional `verifier.toml` in the working
//! directory; every key has a default matching the NDN stack the bot was
//! built for. Review service credentials come from the environment
//! (`GERRIT_USERNAME`, `GERRIT_PASSWORD`) and are never read from the file.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::isolation::RelevancePolicy;

/// Name of the optional configuration file inside the working directory.
pub const CONFIG_FILE: &str = "verifier.toml";

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

/// Review service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GerritConfig {
    /// Base URL of the Gerrit server.
    #[serde(default = "default_gerrit_url")]
    pub url: String,
    /// Project whose changes are verified.
    #[serde(default = "default_project")]
    pub project: String,
    /// Account that must have reviewed a change before it is picked up.
    #[serde(default = "default_bot_reviewer")]
    pub bot_reviewer: String,
    /// Label required for discovery and voted on when reporting.
    #[serde(default = "default_label")]
    pub label: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// HTTP username, from `GERRIT_USERNAME`.
    #[serde(skip)]
    pub username: Option<String>,
    /// HTTP password, from `GERRIT_PASSWORD`.
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_gerrit_url() -> String {
    "https://gerrit.named-data.net".to_string()
}

fn default_project() -> String {
    "NLSR".to_string()
}

fn default_bot_reviewer() -> String {
    "jenkins".to_string()
}

fn default_label() -> String {
    "Verified".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for GerritConfig {
    fn default() -> Self {
        Self {
            url: default_gerrit_url(),
            project: default_project(),
            bot_reviewer: default_bot_reviewer(),
            label: default_label(),
            request_timeout_secs: default_request_timeout(),
            username: None,
            password: None,
        }
    }
}

impl GerritConfig {
    /// Fills credentials from `GERRIT_USERNAME` / `GERRIT_PASSWORD`.
    pub fn with_env_credentials(mut self) -> Self {
        self.username = std::env::var("GERRIT_USERNAME").ok().filter(|v| !v.is_empty());
        self.password = std::env::var("GERRIT_PASSWORD").ok().filter(|v| !v.is_empty());
        self
    }

    /// Request timeout as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Git URL of the project on the review server, used to fetch patch refs.
    pub fn project_url(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.project)
    }
}

impl Validate for GerritConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if !(self.url.starts_with("https://") || self.url.starts_with("http://")) {
            result.add_error(format!("gerrit.url '{}' must be an http(s) URL", self.url));
        }
        if self.project.trim().is_empty() {
            result.add_error("gerrit.project cannot be empty");
        }
        if self.label.trim().is_empty() {
            result.add_error("gerrit.label cannot be empty");
        }
        if self.request_timeout_secs == 0 {
            result.add_error("gerrit.request_timeout_secs must be greater than 0");
        }
        if self.username.is_some() != self.password.is_some() {
            result.add_error("GERRIT_USERNAME and GERRIT_PASSWORD must be set together");
        }
        if self.username.is_none() {
            result.add_warning("no Gerrit credentials set, reviews cannot be posted");
        }

        result
    }
}

/// Sleep intervals between changes and between discovery sweeps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Seconds between discovery sweeps.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Seconds between two evaluated changes within a sweep.
    #[serde(default = "default_change_interval")]
    pub change_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    1500
}

fn default_change_interval() -> u64 {
    30
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            change_interval_secs: default_change_interval(),
        }
    }
}

impl PacingConfig {
    /// Interval between sweeps.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Interval between changes.
    pub fn change_interval(&self) -> Duration {
        Duration::from_secs(self.change_interval_secs)
    }
}

/// Upper bounds for external processes, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Any single git invocation.
    #[serde(default = "default_git_timeout")]
    pub git_secs: u64,
    /// Any single build tool invocation.
    #[serde(default = "default_build_timeout")]
    pub build_secs: u64,
    /// One test scenario.
    #[serde(default = "default_scenario_timeout")]
    pub scenario_secs: u64,
}

fn default_git_timeout() -> u64 {
    300
}

fn default_build_timeout() -> u64 {
    3600
}

fn default_scenario_timeout() -> u64 {
    1800
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            git_secs: default_git_timeout(),
            build_secs: default_build_timeout(),
            scenario_secs: default_scenario_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_secs)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build_secs)
    }

    pub fn scenario(&self) -> Duration {
        Duration::from_secs(self.scenario_secs)
    }
}

/// Build tool invocation for each build step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildToolConfig {
    /// Build tool program, resolved relative to each unit's source tree.
    #[serde(default = "default_build_program")]
    pub program: String,
    /// Arguments that remove previous build configuration.
    #[serde(default = "default_clean_args")]
    pub clean: Vec<String>,
    /// Arguments that configure the tree; unit-specific arguments are appended.
    #[serde(default = "default_configure_args")]
    pub configure: Vec<String>,
    /// Arguments that compile the tree.
    #[serde(default)]
    pub compile: Vec<String>,
    /// Arguments that install a dependency system-wide.
    #[serde(default = "default_install_args")]
    pub install: Vec<String>,
    /// Run the install step through `sudo`.
    #[serde(default = "default_sudo_install")]
    pub sudo_install: bool,
    /// Directory inside each tree whose presence marks a previous build.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
}

fn default_build_program() -> String {
    "./waf".to_string()
}

fn default_clean_args() -> Vec<String> {
    vec!["distclean".to_string()]
}

fn default_configure_args() -> Vec<String> {
    vec!["configure".to_string()]
}

fn default_install_args() -> Vec<String> {
    vec!["install".to_string()]
}

fn default_sudo_install() -> bool {
    true
}

fn default_output_dir() -> String {
    "build".to_string()
}

impl Default for BuildToolConfig {
    fn default() -> Self {
        Self {
            program: default_build_program(),
            clean: default_clean_args(),
            configure: default_configure_args(),
            compile: Vec::new(),
            install: default_install_args(),
            sudo_install: default_sudo_install(),
            output_dir: default_output_dir(),
        }
    }
}

/// One member of the build stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Directory name under the working directory.
    pub name: String,
    /// Canonical remote used for the initial clone.
    pub origin: String,
    /// Extra arguments for the configure step.
    #[serde(default)]
    pub configure_args: Vec<String>,
    /// Marks the component under test (built, never installed).
    #[serde(default)]
    pub under_test: bool,
}

fn default_units() -> Vec<UnitConfig> {
    vec![
        UnitConfig {
            name: "ndn-cxx".to_string(),
            origin: "https://github.com/named-data/ndn-cxx".to_string(),
            configure_args: vec![],
            under_test: false,
        },
        UnitConfig {
            name: "NFD".to_string(),
            origin: "https://github.com/named-data/NFD".to_string(),
            configure_args: vec!["--without-websocket".to_string()],
            under_test: false,
        },
        UnitConfig {
            name: "NLSR".to_string(),
            origin: "https://github.com/named-data/NLSR".to_string(),
            configure_args: vec![],
            under_test: true,
        },
    ]
}

/// Test suite execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Scratch directory wiped before and after every scenario.
    #[serde(default = "default_scratch_root")]
    pub scratch_root: String,
    /// Exit code that marks a scenario as failed.
    #[serde(default = "default_failure_exit_code")]
    pub failure_exit_code: i32,
}

fn default_scratch_root() -> String {
    "/tmp/minindn".to_string()
}

fn default_failure_exit_code() -> i32 {
    1
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            failure_exit_code: default_failure_exit_code(),
        }
    }
}

/// Complete verifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    #[serde(default)]
    pub gerrit: GerritConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub build: BuildToolConfig,
    /// Build stack in dependency order; the component under test comes last.
    #[serde(default = "default_units")]
    pub units: Vec<UnitConfig>,
    #[serde(default)]
    pub suite: SuiteConfig,
    #[serde(default)]
    pub relevance: RelevancePolicy,
    /// Branch the component under test returns to after each change.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
}

fn default_base_branch() -> String {
    "master".to_string()
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            gerrit: GerritConfig::default(),
            pacing: PacingConfig::default(),
            timeouts: TimeoutConfig::default(),
            build: BuildToolConfig::default(),
            units: default_units(),
            suite: SuiteConfig::default(),
            relevance: RelevancePolicy::default(),
            base_branch: default_base_branch(),
        }
    }
}

impl VerifierConfig {
    /// Parses configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Loads `verifier.toml` from the working directory if present, then
    /// fills credentials from the environment.
    pub fn load(work_dir: &Path) -> Result<Self> {
        let path = work_dir.join(CONFIG_FILE);
        let mut config = match std::fs::read_to_string(&path) {
            Ok(content) => {
                tracing::info!(path = ?path, "loading configuration file");
                Self::from_toml(&content)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(Error::Io(e)),
        };
        config.gerrit = config.gerrit.with_env_credentials();
        Ok(config)
    }

    /// Returns the unit marked as under test.
    pub fn under_test(&self) -> Option<&UnitConfig> {
        self.units.iter().find(|u| u.under_test)
    }
}

impl Validate for TimeoutConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        for (key, secs) in [
            ("git_secs", self.git_secs),
            ("build_secs", self.build_secs),
            ("scenario_secs", self.scenario_secs),
        ] {
            if secs == 0 {
                result.add_error(format!("timeouts.{} must be greater than 0", key));
            }
        }
        result
    }
}

impl Validate for SuiteConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        // The scratch area is emptied around every scenario.
        if self.scratch_root.trim().is_empty() || Path::new(&self.scratch_root) == Path::new("/") {
            result.add_error("suite.scratch_root must name a dedicated directory");
        }
        result
    }
}

impl Validate for VerifierConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();
        result.merge(self.gerrit.validate());
        result.merge(self.timeouts.validate());
        result.merge(self.suite.validate());

        if self.units.is_empty() {
            result.add_error("at least one build unit is required");
        }

        let under_test = self.units.iter().filter(|u| u.under_test).count();
        if under_test != 1 {
            result.add_error(format!(
                "exactly one unit must be under_test, found {}",
                under_test
            ));
        } else if self.units.last().is_some_and(|u| !u.under_test) {
            result.add_error("the under_test unit must be last in the build stack");
        }

        let mut seen = HashSet::new();
        for unit in &self.units {
            if unit.name.trim().is_empty() || unit.name.contains('/') {
                result.add_error(format!("invalid unit name '{}'", unit.name));
            }
            if !seen.insert(unit.name.as_str()) {
                result.add_error(format!("duplicate unit name '{}'", unit.name));
            }
            if unit.origin.trim().is_empty() {
                result.add_error(format!("unit '{}' has no origin", unit.name));
            }
        }

        if self.build.program.trim().is_empty() {
            result.add_error("build.program cannot be empty");
        }

        if self.base_branch.trim().is_empty() {
            result.add_error("base_branch cannot be empty");
        }

        if self.relevance.is_empty() {
            result.add_error("relevance policy must list at least one extension or file name");
        }

        if self.pacing.poll_interval_secs < 60 {
            result.add_warning("poll_interval_secs under 60 may overload the review service");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_credentials(mut config: VerifierConfig) -> VerifierConfig {
        config.gerrit.username = Some("bot".to_string());
        config.gerrit.password = Some("secret".to_string());
        config
    }

    #[test]
    fn default_config_is_valid() {
        let config = with_credentials(VerifierConfig::default());
        let result = config.validate();

        assert!(result.is_valid(), "errors: {:?}", result.errors);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn default_stack_is_ndn() {
        let config = VerifierConfig::default();
        let names: Vec<_> = config.units.iter().map(|u| u.name.as_str()).collect();

        assert_eq!(names, vec!["ndn-cxx", "NFD", "NLSR"]);
        assert_eq!(config.under_test().unwrap().name, "NLSR");
        assert_eq!(config.units[1].configure_args, vec!["--without-websocket"]);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = VerifierConfig::from_toml(
            r#"
            base_branch = "main"

            [gerrit]
            project = "NFD"

            [pacing]
            poll_interval_secs = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.base_branch, "main");
        assert_eq!(config.gerrit.project, "NFD");
        assert_eq!(config.gerrit.label, "Verified");
        assert_eq!(config.pacing.poll_interval(), Duration::from_secs(600));
        assert_eq!(config.pacing.change_interval(), Duration::from_secs(30));
        assert_eq!(config.units.len(), 3);
    }

    #[test]
    fn toml_units_replace_default_stack() {
        let config = VerifierConfig::from_toml(
            r#"
            [[units]]
            name = "libfoo"
            origin = "https://example.org/libfoo"

            [[units]]
            name = "app"
            origin = "https://example.org/app"
            under_test = true
            "#,
        )
        .unwrap();

        assert_eq!(config.units.len(), 2);
        assert!(!config.units[0].under_test);
        assert!(config.units[1].under_test);
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let err = VerifierConfig::from_toml("[gerrit\nurl = 1").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn under_test_must_be_last_and_unique() {
        let mut config = with_credentials(VerifierConfig::default());
        config.units.swap(0, 2);
        assert!(!config.validate().is_valid());

        let mut config = with_credentials(VerifierConfig::default());
        config.units[0].under_test = true;
        assert!(!config.validate().is_valid());
    }

    #[test]
    fn duplicate_units_are_rejected() {
        let mut config = with_credentials(VerifierConfig::default());
        config.units[1].name = "ndn-cxx".to_string();

        let result = config.validate();
        assert!(result.errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = with_credentials(VerifierConfig::default());
        config.timeouts.scenario_secs = 0;

        assert!(config.validate().into_result().is_err());
    }

    #[test]
    fn root_scratch_dir_is_rejected() {
        let mut config = with_credentials(VerifierConfig::default());
        config.suite.scratch_root = "//".to_string();

        assert!(!config.validate().is_valid());
    }

    #[test]
    fn section_problems_are_collected_together() {
        let mut config = VerifierConfig::default();
        config.gerrit.project = String::new();
        config.timeouts.git_secs = 0;
        config.timeouts.build_secs = 0;
        config.suite.scratch_root = " ".to_string();

        let result = config.validate();
        assert_eq!(result.errors.len(), 4, "errors: {:?}", result.errors);
        assert!(result.errors.iter().any(|e| e.contains("timeouts.git_secs")));
        assert!(result.errors.iter().any(|e| e.contains("timeouts.build_secs")));
        assert!(result.errors.iter().any(|e| e.contains("scratch_root")));
        // The credentials warning from the gerrit section survives the merge.
        assert!(result.warnings.iter().any(|w| w.contains("credentials")));

        let err = config.validate().into_result().unwrap_err().to_string();
        assert!(err.contains("gerrit.project"));
    }

    #[test]
    fn missing_credentials_is_warning_only() {
        let config = VerifierConfig::default();
        let result = config.validate();

        assert!(result.is_valid());
        assert!(result.warnings.iter().any(|w| w.contains("credentials")));
    }

    #[test]
    fn half_credentials_is_error() {
        let mut config = VerifierConfig::default();
        config.gerrit.username = Some("bot".to_string());

        assert!(!config.validate().is_valid());
    }

    #[test]
    fn project_url_joins_without_double_slash() {
        let gerrit = GerritConfig {
            url: "https://gerrit.example.org/".to_string(),
            ..Default::default()
        };
        assert_eq!(gerrit.project_url(), "https://gerrit.example.org/NLSR");
    }

    #[test]
    fn validation_result_merges() {
        let mut a = ValidationResult::default();
        a.add_error("e1");
        let mut b = ValidationResult::default();
        b.add_warning("w1");
        a.merge(b);

        assert_eq!(a.errors, vec!["e1"]);
        assert_eq!(a.warnings, vec!["w1"]);
    }
}
