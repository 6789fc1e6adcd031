//! Pure enqueue decision.
//!
//! Given a candidate commit for a ref and the current store contents, decide
//! whether a new build is warranted. The function reads state only; the caller
//! applies the outcome.

use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::store::StoreState;
use crate::types::{BuildId, BuildTrigger, PrNumber, RefKey, RepositoryId, Sha};

/// A commit that some producer believes may need building.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub repo_id: RepositoryId,
    pub trigger: BuildTrigger,
    pub ref_name: String,
    pub sha: Sha,
    pub pr_number: Option<PrNumber>,
}

impl Candidate {
    pub fn ref_key(&self) -> RefKey {
        RefKey::new(&self.ref_name, self.pr_number)
    }
}

/// Why a candidate did not produce a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// This exact `(repo, ref, pr, sha)` already built successfully.
    AlreadySucceeded,
    /// The ref enqueued too recently.
    Cooldown,
    /// Another build of the same commit is queued or running.
    ActiveBuild(BuildId),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadySucceeded => f.write_str("already built successfully"),
            SkipReason::Cooldown => f.write_str("ref is cooling down"),
            SkipReason::ActiveBuild(id) => write!(f, "build {} is already in flight", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Create,
    Skip(SkipReason),
}

/// Decides whether `candidate` should become a new build.
///
/// Checks run in a fixed order:
/// 1. Same SHA as the last enqueue for this ref: skip only if a build of the
///    exact key succeeded. Otherwise fall through, which lets a failed commit
///    be retried without a new push.
/// 2. Unless `ignore_cooldown`, skip while `now - last_enqueued_at < cooldown`.
/// 3. Skip if any queued or running build targets the same commit of the
///    repository, whatever its ref.
pub fn decide(
    state: &StoreState,
    candidate: &Candidate,
    now: DateTime<Utc>,
    cooldown: Duration,
    ignore_cooldown: bool,
) -> Decision {
    let key = candidate.ref_key();
    let ref_state = state.ref_state(candidate.repo_id, &key);

    if let Some(rs) = ref_state
        && rs.last_sha == candidate.sha
        && state.has_successful_build(
            candidate.repo_id,
            &candidate.ref_name,
            candidate.pr_number,
            &candidate.sha,
        )
    {
        return Decision::Skip(SkipReason::AlreadySucceeded);
    }

    if !ignore_cooldown
        && let Some(rs) = ref_state
        && now - rs.last_enqueued_at < cooldown
    {
        return Decision::Skip(SkipReason::Cooldown);
    }

    if let Some(active) = state.active_build_for_commit(candidate.repo_id, &candidate.sha) {
        return Decision::Skip(SkipReason::ActiveBuild(active.id));
    }

    Decision::Create
}
