//! Test manifest parsing.
//!
//! One scenario per line in the form `name:command`. The command is split on
//! whitespace into an argv; no shell is involved. Blank lines and lines
//! starting with `#` are ignored.

use std::path::Path;

use crate::error::{Error, Result};

/// A named, independently executable test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestScenario {
    /// Name reported in review messages.
    pub name: String,
    /// Program followed by its arguments.
    pub argv: Vec<String>,
}

/// Ordered list of scenarios; file order is execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    scenarios: Vec<TestScenario>,
}

impl Manifest {
    /// Parses manifest text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut scenarios = Vec::new();

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line_no = index + 1;

            let (name, command) = line.split_once(':').ok_or_else(|| Error::Manifest {
                line: line_no,
                reason: "expected '<name>:<command>'".to_string(),
            })?;

            let name = name.trim();
            if name.is_empty() {
                return Err(Error::Manifest {
                    line: line_no,
                    reason: "scenario name is empty".to_string(),
                });
            }

            let argv: Vec<String> = command.split_whitespace().map(String::from).collect();
            if argv.is_empty() {
                return Err(Error::Manifest {
                    line: line_no,
                    reason: format!("scenario '{}' has no command", name),
                });
            }

            scenarios.push(TestScenario {
                name: name.to_string(),
                argv,
            });
        }

        Ok(Self { scenarios })
    }

    /// Reads and parses the manifest file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read manifest {}: {}", path.display(), e))
        })?;
        let manifest = Self::parse(&content)?;
        tracing::info!(path = ?path, scenarios = manifest.len(), "loaded test manifest");
        Ok(manifest)
    }

    /// Scenarios in execution order.
    pub fn scenarios(&self) -> &[TestScenario] {
        &self.scenarios
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}
