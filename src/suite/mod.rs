//! Emulation test suite: manifest of scenarios and the runner executing them.

mod manifest;
mod runner;

pub use manifest::{Manifest, TestScenario};
pub use runner::{clear_scratch, ScenarioRun, SuiteReport, SuiteRunner};
