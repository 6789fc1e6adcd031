//! Read-only access to the upstream source-control API.
//!
//! Reconciliation needs two questions answered per repository: which pull
//! requests are open (with their head commit and branch), and what commit a
//! branch currently points at. [`SourceControl`] is that seam; [`GitHubClient`]
//! answers it through octocrab, and tests substitute an in-memory fake.

mod client;
mod error;

use std::future::Future;

use crate::types::{PrNumber, Sha};

pub use client::GitHubClient;
pub use error::{GitHubApiError, GitHubErrorKind};

/// An open pull request as listed upstream.
///
/// Head fields are optional: a PR whose head branch was deleted can be listed
/// without them, and such PRs are not buildable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPull {
    pub number: PrNumber,
    pub head_sha: Option<Sha>,
    pub head_ref: Option<String>,
}

/// Upstream queries used by reconciliation.
pub trait SourceControl: Send + Sync + 'static {
    /// Whether calls can be authenticated at all.
    fn has_credentials(&self) -> bool {
        true
    }

    /// Lists every open pull request, following pagination to the end.
    fn list_open_pulls(
        &self,
        owner: &str,
        repo: &str,
    ) -> impl Future<Output = Result<Vec<OpenPull>, GitHubApiError>> + Send;

    /// Resolves a branch name to its tip commit.
    fn branch_tip(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> impl Future<Output = Result<Option<Sha>, GitHubApiError>> + Send;
}
