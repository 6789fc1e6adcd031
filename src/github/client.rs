//! Octocrab-backed implementation of [`SourceControl`].

use octocrab::Octocrab;
use serde::Deserialize;

use super::{GitHubApiError, OpenPull, SourceControl};
use crate::types::{PrNumber, Sha};

const PAGE_SIZE: u8 = 100;

/// A GitHub API client.
///
/// Built without a token, every call fails with a permanent
/// "missing credentials" error instead of hitting the API anonymously.
#[derive(Clone)]
pub struct GitHubClient {
    client: Option<Octocrab>,
}

impl GitHubClient {
    /// Creates a client from an optional personal access token.
    pub fn from_token(token: Option<&str>) -> Result<Self, GitHubApiError> {
        let client = match token {
            Some(token) => Some(
                Octocrab::builder()
                    .personal_token(token.to_string())
                    .build()
                    .map_err(GitHubApiError::from_octocrab)?,
            ),
            None => None,
        };
        Ok(Self { client })
    }

    fn inner(&self) -> Result<&Octocrab, GitHubApiError> {
        self.client
            .as_ref()
            .ok_or_else(GitHubApiError::missing_credentials)
    }
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("authenticated", &self.client.is_some())
            .finish_non_exhaustive()
    }
}

impl SourceControl for GitHubClient {
    fn has_credentials(&self) -> bool {
        self.client.is_some()
    }

    async fn list_open_pulls(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<OpenPull>, GitHubApiError> {
        let client = self.inner()?;
        let mut page = 1u32;
        let mut all_prs = Vec::new();

        loop {
            let page_result = client
                .pulls(owner, repo)
                .list()
                .state(octocrab::params::State::Open)
                .per_page(PAGE_SIZE)
                .page(page)
                .send()
                .await
                .map_err(GitHubApiError::from_octocrab)?;

            let items = page_result.items;
            let is_last_page = items.len() < usize::from(PAGE_SIZE);

            all_prs.extend(items.into_iter().map(|pull| OpenPull {
                number: PrNumber(pull.number),
                head_sha: Some(pull.head.sha).filter(|s| !s.is_empty()).map(Sha::new),
                head_ref: Some(pull.head.ref_field).filter(|s| !s.is_empty()),
            }));

            if is_last_page {
                break;
            }
            page += 1;
        }

        Ok(all_prs)
    }

    async fn branch_tip(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<Option<Sha>, GitHubApiError> {
        let client = self.inner()?;
        let url = format!(
            "/repos/{}/{}/commits/{}",
            owner,
            repo,
            urlencoding::encode(branch)
        );

        let commit: CommitResponse = client
            .get(&url, None::<&()>)
            .await
            .map_err(GitHubApiError::from_octocrab)?;

        Ok(Some(commit.sha).filter(|s| !s.is_empty()).map(Sha::new))
    }
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default)]
    sha: String,
}
