//! Policy deciding which changed paths warrant a rebuild and test run.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::git::ChangedPath;

/// Extensions and file names that mark a change as build-relevant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelevancePolicy {
    /// File extensions without the leading dot, compared case-insensitively.
    #[serde(default = "default_extensions")]
    pub extensions: BTreeSet<String>,
    /// Exact file names (any directory), e.g. build scripts.
    #[serde(default = "default_file_names")]
    pub file_names: BTreeSet<String>,
}

fn default_extensions() -> BTreeSet<String> {
    ["c", "cc", "cpp", "cxx", "h", "hh", "hpp", "hxx", "ipp"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_file_names() -> BTreeSet<String> {
    [
        "wscript",
        "wscript_build",
        "CMakeLists.txt",
        "Makefile",
        "meson.build",
        "configure.ac",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for RelevancePolicy {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            file_names: default_file_names(),
        }
    }
}

impl RelevancePolicy {
    /// A policy matching nothing, to be extended with the builder methods.
    pub fn empty() -> Self {
        Self {
            extensions: BTreeSet::new(),
            file_names: BTreeSet::new(),
        }
    }

    /// Adds an extension (a leading dot is ignored).
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extensions
            .insert(extension.trim_start_matches('.').to_ascii_lowercase());
        self
    }

    /// Adds an exact file name.
    pub fn with_file_name(mut self, name: &str) -> Self {
        self.file_names.insert(name.to_string());
        self
    }

    /// Returns true if the policy matches nothing.
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty() && self.file_names.is_empty()
    }

    /// Returns true if `path` is build-relevant.
    pub fn is_relevant(&self, path: &Path) -> bool {
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if self.file_names.contains(name) {
                return true;
            }
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => self
                .extensions
                .iter()
                .any(|known| known.trim_start_matches('.').eq_ignore_ascii_case(ext)),
            None => false,
        }
    }

    /// Returns true if any path of any change is build-relevant.
    pub fn any_relevant(&self, changes: &[ChangedPath]) -> bool {
        changes
            .iter()
            .flat_map(ChangedPath::paths)
            .any(|path| self.is_relevant(path))
    }
}
