//! Per-ref dedup and cooldown state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{PrNumber, RepositoryId, Sha};

/// Canonical dedup key for a trackable ref.
///
/// `pr:<number>` for pull requests, `branch:<name>` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefKey(String);

impl RefKey {
    /// Computes the key for a ref, preferring the PR number when present.
    pub fn new(ref_name: &str, pr: Option<PrNumber>) -> Self {
        match pr {
            Some(pr) => RefKey(format!("pr:{}", pr.0)),
            None => RefKey(format!("branch:{}", ref_name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last enqueue for one ref of one repository.
///
/// At most one row exists per `(repo_id, ref_key)`; it is created on the first
/// enqueue for that ref and updated on every later one, never on a skip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefState {
    pub repo_id: RepositoryId,
    pub ref_key: RefKey,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub pr_number: Option<PrNumber>,
    pub last_sha: Sha,
    pub last_enqueued_at: DateTime<Utc>,
}
