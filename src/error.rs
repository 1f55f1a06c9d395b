//! Error types for the patch verifier.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for verification operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The test manifest could not be parsed.
    #[error("invalid manifest line {line}: {reason}")]
    Manifest { line: usize, reason: String },

    /// The persisted state file exists but is not a valid record.
    #[error("state file {path} is corrupt: {source}")]
    StateCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Review service request failed.
    #[error("review service request failed: {0}")]
    Network(String),

    /// A build step of a stack unit failed.
    #[error("build of {unit} failed during {step}: {detail}")]
    Build {
        unit: String,
        step: String,
        detail: String,
    },

    /// The patch could not be materialized on an isolation branch.
    #[error("patch isolation failed: {0}")]
    Isolation(String),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// A child process could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true for errors that must stop the process at startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::Manifest { .. } | Error::StateCorrupt { .. }
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result type alias for verification operations.
pub type Result<T> = std::result::Result<T, Error>;
