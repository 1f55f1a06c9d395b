//! Posting verdicts back to the review server as a message plus a label
//! vote on the evaluated patch set.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::Result;

use super::{Change, ReviewInput, ReviewService, Revision, Verdict};

/// Posts verdicts as votes on the verification label.
pub struct ReviewReporter {
    service: Arc<dyn ReviewService>,
    label: String,
}

impl ReviewReporter {
    pub fn new(service: Arc<dyn ReviewService>, label: impl Into<String>) -> Self {
        Self {
            service,
            label: label.into(),
        }
    }

    /// Review body for `verdict`.
    pub fn review_for(&self, verdict: &Verdict) -> ReviewInput {
        ReviewInput {
            message: verdict.message(),
            labels: BTreeMap::from([(self.label.clone(), verdict.score())]),
        }
    }

    /// Posts `verdict` on `revision` of `change`.
    pub async fn report(&self, change: &Change, revision: &Revision, verdict: &Verdict) -> Result<()> {
        let review = self.review_for(verdict);
        self.service
            .post_review(change.number, revision.patch_number, &review)
            .await?;

        tracing::info!(
            change_id = %change.change_id,
            patch = revision.patch_number,
            score = verdict.score(),
            verdict = %verdict,
            "reported verdict"
        );
        Ok(())
    }
}
