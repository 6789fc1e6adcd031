//! Build records and their status lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BuildId, PrNumber, RepositoryId, Sha};

/// What caused a build to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildTrigger {
    /// An open pull request's head commit.
    Pr,
    /// The default branch tip (push or merge).
    Merge,
    /// An operator request; checks out the repository's default branch.
    Manual,
}

impl fmt::Display for BuildTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildTrigger::Pr => "PR",
            BuildTrigger::Merge => "MERGE",
            BuildTrigger::Manual => "MANUAL",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a build.
///
/// Transitions are monotonic: `Queued -> Running -> {Success, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failed,
}

impl BuildStatus {
    /// Returns true for `Queued` and `Running`.
    pub fn is_active(self) -> bool {
        matches!(self, BuildStatus::Queued | BuildStatus::Running)
    }

    /// Returns true for `Success` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }

    /// Whether `self -> next` is a legal lifecycle step.
    ///
    /// A queued build may only be claimed (`Running`); a running build may
    /// only finish. Terminal states never change.
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        matches!(
            (self, next),
            (BuildStatus::Queued, BuildStatus::Running)
                | (BuildStatus::Running, BuildStatus::Success)
                | (BuildStatus::Running, BuildStatus::Failed)
        )
    }

    /// Parses the wire form (`QUEUED`, `RUNNING`, ...), case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Some(BuildStatus::Queued),
            "RUNNING" => Some(BuildStatus::Running),
            "SUCCESS" => Some(BuildStatus::Success),
            "FAILED" => Some(BuildStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildStatus::Queued => "QUEUED",
            BuildStatus::Running => "RUNNING",
            BuildStatus::Success => "SUCCESS",
            BuildStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// A single build of one commit of one repository.
///
/// Builds refer to their repository by id only; callers that need the
/// repository load it explicitly (see `Store::claim_next_queued`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: BuildId,
    pub repo_id: RepositoryId,
    pub trigger: BuildTrigger,
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub commit_sha: Sha,
    pub pr_number: Option<PrNumber>,
    pub status: BuildStatus,

    /// Append-only log text, one entry per line. Kept outside the stored
    /// record and only filled when a single build is fetched.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log: String,

    /// Canonical artifact location, set on success.
    pub artifact_path: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Build {
    /// Label used in log lines: `pr:<n>` for PR builds, `ref:<name>` otherwise.
    pub fn label(&self) -> String {
        match self.pr_number {
            Some(pr) => format!("pr:{}", pr.0),
            None => format!("ref:{}", self.ref_name),
        }
    }
}

/// Fields of a build about to be inserted; the store assigns the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBuild {
    pub repo_id: RepositoryId,
    pub trigger: BuildTrigger,
    pub ref_name: String,
    pub commit_sha: Sha,
    pub pr_number: Option<PrNumber>,
}
