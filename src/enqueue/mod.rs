//! Enqueue decisions and the atomic enqueuer shared by every producer.
//!
//! Webhook ingestion and reconciliation both funnel candidates through
//! [`Enqueuer::enqueue`]. The decision, the build insert, and the ref-state
//! upsert happen in one store transaction, so two producers racing on the
//! same ref can never both create a build for the same state change.

mod decision;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::store::{Store, StoreError};
use crate::types::{Build, NewBuild, RefState};

pub use decision::{Candidate, Decision, SkipReason, decide};

/// Result of offering a candidate to the enqueuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(Build),
    Skipped(SkipReason),
}

impl EnqueueOutcome {
    pub fn created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// Applies [`decide`] against the store atomically.
#[derive(Debug, Clone)]
pub struct Enqueuer {
    store: Store,
    cooldown: Duration,
}

impl Enqueuer {
    pub fn new(store: Store, cooldown: std::time::Duration) -> Self {
        let cooldown = Duration::from_std(cooldown).unwrap_or_else(|_| Duration::weeks(52));
        Enqueuer { store, cooldown }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Evaluates `candidate` and, if warranted, creates a queued build and
    /// records the enqueue on the ref.
    pub async fn enqueue(
        &self,
        candidate: Candidate,
        ignore_cooldown: bool,
    ) -> Result<EnqueueOutcome, StoreError> {
        let cooldown = self.cooldown;
        let offered = candidate.clone();
        let outcome = self.store.update(move |state| {
            let candidate = offered;
            let now = Utc::now();
            match decide(state, &candidate, now, cooldown, ignore_cooldown) {
                Decision::Skip(reason) => Ok(EnqueueOutcome::Skipped(reason)),
                Decision::Create => {
                    let build = state.insert_build(
                        NewBuild {
                            repo_id: candidate.repo_id,
                            trigger: candidate.trigger,
                            ref_name: candidate.ref_name.clone(),
                            commit_sha: candidate.sha.clone(),
                            pr_number: candidate.pr_number,
                        },
                        now,
                    );
                    state.upsert_ref_state(RefState {
                        repo_id: candidate.repo_id,
                        ref_key: candidate.ref_key(),
                        ref_name: candidate.ref_name,
                        pr_number: candidate.pr_number,
                        last_sha: candidate.sha,
                        last_enqueued_at: now,
                    });
                    Ok(EnqueueOutcome::Created(build))
                }
            }
        })
        .await?;

        match &outcome {
            EnqueueOutcome::Created(build) => info!(
                build_id = %build.id,
                repo_id = %candidate.repo_id,
                trigger = %candidate.trigger,
                ref_name = %candidate.ref_name,
                sha = %candidate.sha.short(),
                "Enqueued build"
            ),
            EnqueueOutcome::Skipped(reason) => debug!(
                repo_id = %candidate.repo_id,
                ref_key = %candidate.ref_key(),
                sha = %candidate.sha.short(),
                %reason,
                "Skipped candidate"
            ),
        }

        Ok(outcome)
    }
}
