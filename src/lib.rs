//! Patch Verifier - continuous verification of code-review changes
//!
//! Polls a Gerrit server for open changes, rebuilds a layered source stack
//! with each new patch applied on a disposable branch, runs an emulation
//! test suite against it, and posts a scored verdict back to the change.

pub mod config;
pub mod error;
pub mod exec;
pub mod git;
pub mod isolation;
pub mod orchestrator;
pub mod review;
pub mod stack;
pub mod state;
pub mod suite;

pub use config::{Validate, ValidationResult, VerifierConfig};
pub use error::{Error, Result};
pub use exec::{CommandOutput, CommandRunner, CommandSpec, ExitOutcome, SystemRunner};
pub use isolation::{IsolationBranch, PatchIsolation, RelevancePolicy};
pub use orchestrator::{CycleSummary, Orchestrator};
pub use review::{
    Change, ChangeQuery, ChangeStatus, GerritClient, ReviewInput, ReviewReporter, ReviewService,
    Revision, Verdict,
};
pub use stack::{BuildStatus, BuildUnit, StackBuilder, UnitRole};
pub use state::StateStore;
pub use suite::{Manifest, SuiteReport, SuiteRunner, TestScenario};
