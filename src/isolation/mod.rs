//! Patch isolation for the component under test.
//!
//! A candidate patch is merged onto a disposable branch named after its
//! change-id; [`IsolationBranch`] guarantees the tree returns to the base
//! branch afterwards. [`RelevancePolicy`] decides whether the patch touches
//! anything worth building and testing.

mod branch;
mod relevance;

pub use branch::{branch_name_for, IsolationBranch, PatchIsolation};
pub use relevance::RelevancePolicy;
