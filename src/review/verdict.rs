//! Outcome of evaluating one change.

use std::fmt;

/// The single outcome posted back for a change revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The stack or the patched tree could not be built, or the patch could
    /// not be applied. `reason` is logged but not posted.
    BuildFailed { reason: String },
    /// The patch touches nothing that is compiled or built.
    NoRelevantChange,
    /// The named scenario failed; later scenarios did not run.
    ScenarioFailed { name: String },
    /// Every scenario ran without a failure.
    AllPassed { scenarios: Vec<String> },
}

impl Verdict {
    pub fn build_failed(reason: impl fmt::Display) -> Self {
        Verdict::BuildFailed {
            reason: reason.to_string(),
        }
    }

    /// Score applied to the verification label.
    pub fn score(&self) -> i32 {
        match self {
            Verdict::BuildFailed { .. } | Verdict::NoRelevantChange => 0,
            Verdict::ScenarioFailed { .. } => -1,
            Verdict::AllPassed { .. } => 1,
        }
    }

    /// Review message posted with the score.
    pub fn message(&self) -> String {
        match self {
            Verdict::BuildFailed { .. } => "Unable to compile this patch!".to_string(),
            Verdict::NoRelevantChange => "No change in code, skipped testing!".to_string(),
            Verdict::ScenarioFailed { name } => format!("Test {} failed!", name),
            Verdict::AllPassed { scenarios } if scenarios.is_empty() => {
                "All tests passed!".to_string()
            }
            Verdict::AllPassed { scenarios } => {
                let mut message = String::from("All tests passed!\n\nTests run:");
                for name in scenarios {
                    message.push_str("\n* ");
                    message.push_str(name);
                }
                message
            }
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::BuildFailed { reason } => write!(f, "build failed ({})", reason),
            Verdict::NoRelevantChange => write!(f, "no relevant change"),
            Verdict::ScenarioFailed { name } => write!(f, "scenario {} failed", name),
            Verdict::AllPassed { scenarios } => {
                write!(f, "all {} scenarios passed", scenarios.len())
            }
        }
    }
}
