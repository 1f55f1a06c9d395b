//! Review server integration.
//!
//! [`ReviewService`] is the seam between the pipeline and the review server;
//! [`GerritClient`] implements it over the Gerrit REST API.
//! [`ReviewReporter`] turns a [`Verdict`] into a posted review.

mod gerrit;
mod reporter;
mod verdict;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use gerrit::{ChangeQuery, GerritClient};
pub use reporter::ReviewReporter;
pub use verdict::Verdict;

/// Lifecycle state of a change on the review server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeStatus {
    New,
    Merged,
    Abandoned,
    #[serde(other)]
    Unknown,
}

/// A patch set of a change, identified by its fetchable ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    /// Patch set number.
    pub patch_number: u32,
    /// Git ref the patch set can be fetched from.
    pub fetch_ref: String,
}

/// A proposed code modification awaiting review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Stable change identifier (`I...`), the state store key.
    pub change_id: String,
    /// Server-side change number, used in REST paths.
    pub number: u64,
    pub subject: String,
    pub status: ChangeStatus,
    /// Whether the server reports the change as mergeable into its target
    /// branch. `None` when the server did not compute it.
    pub mergeable: Option<bool>,
    /// Current revision, when the server returned it with the change.
    pub revision: Option<Revision>,
}

impl Change {
    pub fn new(change_id: impl Into<String>, number: u64, subject: impl Into<String>) -> Self {
        Self {
            change_id: change_id.into(),
            number,
            subject: subject.into(),
            status: ChangeStatus::New,
            mergeable: None,
            revision: None,
        }
    }

    pub fn with_revision(mut self, patch_number: u32, fetch_ref: impl Into<String>) -> Self {
        self.revision = Some(Revision {
            patch_number,
            fetch_ref: fetch_ref.into(),
        });
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == ChangeStatus::New
    }
}

/// Body of a review post: a message plus label votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewInput {
    pub message: String,
    pub labels: BTreeMap<String, i32>,
}

/// Operations the pipeline needs from the review server.
#[async_trait]
pub trait ReviewService: Send + Sync {
    /// Changes matching `query`, in server order.
    async fn query_changes(&self, query: &str) -> Result<Vec<Change>>;

    /// Current revision of change `number`.
    async fn current_revision(&self, number: u64) -> Result<Revision>;

    /// Returns true while change `number` is still open.
    async fn is_open(&self, number: u64) -> Result<bool>;

    /// Posts `review` on patch set `patch_number` of change `number`.
    async fn post_review(&self, number: u64, patch_number: u32, review: &ReviewInput)
        -> Result<()>;
}
