//! Reconciliation: re-derive desired builds from the upstream API.
//!
//! A pass lists every active repository's open pull requests and its default
//! branch tip, and offers each as a candidate to the [`Enqueuer`]. It also
//! removes artifact folders of PRs that are no longer open.
//!
//! Upstream failures are logged per repository and never abort the pass.
//! Passes are single-flight: a trigger while one is running is dropped.

mod gc;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{error, info, warn};

use crate::enqueue::{Candidate, EnqueueOutcome, Enqueuer};
use crate::github::{GitHubApiError, SourceControl};
use crate::pipeline::ArtifactLayout;
use crate::store::StoreError;
use crate::types::{BuildTrigger, PrNumber, Repository, RepositoryId, Sha};

pub use gc::remove_closed_pr_artifacts;

/// Why a targeted sync could not evaluate a candidate.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("repository not found or inactive")]
    RepoNotFound,

    #[error("pull request is not open or has no head")]
    PrNotFound,

    #[error("branch has no tip commit")]
    ShaNotFound,

    #[error("failed to list pull requests: {0}")]
    FailedToListPrs(#[source] GitHubApiError),

    #[error("failed to read branch: {0}")]
    BranchReadFailed(#[source] GitHubApiError),

    #[error("no API credentials configured")]
    MissingCredentials,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Stable snake_case code reported to API callers.
    pub fn reason(&self) -> &'static str {
        match self {
            SyncError::RepoNotFound => "repo_not_found",
            SyncError::PrNotFound => "pr_not_found",
            SyncError::ShaNotFound => "sha_not_found",
            SyncError::FailedToListPrs(_) => "failed_to_list_prs",
            SyncError::BranchReadFailed(_) => "branch_read_failed",
            SyncError::MissingCredentials => "missing_credentials",
            SyncError::Store(_) => "store_error",
        }
    }
}

/// Result of a targeted sync that reached the enqueuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub enqueued: bool,
    pub ref_name: String,
    pub sha: Sha,
}

/// Result of a full reconciliation trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRun {
    Completed { repositories: usize, enqueued: usize },
    AlreadyRunning,
    MissingCredentials,
}

/// Resets the single-flight flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// The reconciliation engine.
#[derive(Debug)]
pub struct Reconciler<S> {
    enqueuer: Enqueuer,
    source: Arc<S>,
    artifacts: ArtifactLayout,
    in_progress: AtomicBool,
}

impl<S: SourceControl> Reconciler<S> {
    pub fn new(enqueuer: Enqueuer, source: Arc<S>, artifact_root: impl Into<PathBuf>) -> Self {
        Reconciler {
            enqueuer,
            source,
            artifacts: ArtifactLayout::new(artifact_root),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Reconciles every active repository.
    pub async fn sync_all(&self, ignore_cooldown: bool) -> SyncRun {
        if !self.source.has_credentials() {
            warn!("GitHub token not set, skipping sync");
            return SyncRun::MissingCredentials;
        }

        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Sync already in progress, dropping trigger");
            return SyncRun::AlreadyRunning;
        }
        let _guard = PassGuard(&self.in_progress);

        let repos = self.enqueuer.store().active_repositories();
        info!(repositories = repos.len(), "Sync start");

        let mut enqueued = 0;
        for repo in &repos {
            enqueued += self.sync_repo(repo, ignore_cooldown).await;
        }

        info!(repositories = repos.len(), enqueued, "Sync done");
        SyncRun::Completed {
            repositories: repos.len(),
            enqueued,
        }
    }

    /// Resyncs one repository by id with the cooldown ignored.
    pub async fn sync_repository(&self, repo_id: RepositoryId) -> Result<usize, SyncError> {
        let repo = self
            .enqueuer
            .store()
            .get_active_repository(repo_id)
            .ok_or(SyncError::RepoNotFound)?;
        if !self.source.has_credentials() {
            return Err(SyncError::MissingCredentials);
        }
        Ok(self.sync_repo(&repo, true).await)
    }

    /// Reconciles one repository, returning how many builds were created.
    pub async fn sync_repo(&self, repo: &Repository, ignore_cooldown: bool) -> usize {
        let full_name = repo.full_name();

        let pulls = match self.source.list_open_pulls(&repo.owner, &repo.name).await {
            Ok(pulls) => pulls,
            Err(e) => {
                error!(repo = %full_name, error = %e, kind = %e.kind, "Failed to list PRs");
                return 0;
            }
        };
        info!(repo = %full_name, open_prs = pulls.len(), "Listed open PRs");

        let open: HashSet<PrNumber> = pulls.iter().map(|p| p.number).collect();
        let repo_dir = self.artifacts.repo_dir(&repo.name);
        if let Err(e) = remove_closed_pr_artifacts(&repo_dir, &open).await {
            warn!(repo = %full_name, error = %e, "Stale artifact cleanup failed");
        }

        let mut enqueued = 0;
        for pull in pulls {
            let (Some(sha), Some(head_ref)) = (pull.head_sha, pull.head_ref) else {
                continue;
            };
            let candidate = Candidate {
                repo_id: repo.id,
                trigger: BuildTrigger::Pr,
                ref_name: head_ref,
                sha,
                pr_number: Some(pull.number),
            };
            if self.offer(candidate, ignore_cooldown).await {
                enqueued += 1;
            }
        }

        match self
            .source
            .branch_tip(&repo.owner, &repo.name, &repo.default_branch)
            .await
        {
            Ok(Some(sha)) => {
                let candidate = Candidate {
                    repo_id: repo.id,
                    trigger: BuildTrigger::Merge,
                    ref_name: repo.default_branch.clone(),
                    sha,
                    pr_number: None,
                };
                if self.offer(candidate, ignore_cooldown).await {
                    enqueued += 1;
                }
            }
            Ok(None) => {
                warn!(repo = %full_name, branch = %repo.default_branch, "Default branch has no tip");
            }
            Err(e) => {
                error!(
                    repo = %full_name,
                    branch = %repo.default_branch,
                    error = %e,
                    "Failed to read default branch"
                );
            }
        }

        enqueued
    }

    /// Evaluates a single PR or branch of one repository.
    ///
    /// With `pr` set, the PR must currently be open. Otherwise `ref_name`
    /// (default: the repository's default branch) is resolved to its tip.
    /// `force` ignores the cooldown.
    pub async fn sync_selection(
        &self,
        repo_id: RepositoryId,
        pr: Option<PrNumber>,
        ref_name: Option<&str>,
        force: bool,
    ) -> Result<Selection, SyncError> {
        let repo = self
            .enqueuer
            .store()
            .get_active_repository(repo_id)
            .ok_or(SyncError::RepoNotFound)?;
        if !self.source.has_credentials() {
            return Err(SyncError::MissingCredentials);
        }

        info!(
            repo = %repo.full_name(),
            pr = ?pr.map(|p| p.0),
            ref_name = ?ref_name,
            force,
            "Manual sync"
        );

        if let Some(pr) = pr {
            let pulls = self
                .source
                .list_open_pulls(&repo.owner, &repo.name)
                .await
                .map_err(SyncError::FailedToListPrs)?;
            let pull = pulls
                .into_iter()
                .find(|p| p.number == pr)
                .ok_or(SyncError::PrNotFound)?;
            let (Some(sha), Some(head_ref)) = (pull.head_sha, pull.head_ref) else {
                return Err(SyncError::PrNotFound);
            };

            return self
                .select(
                    Candidate {
                        repo_id: repo.id,
                        trigger: BuildTrigger::Pr,
                        ref_name: head_ref,
                        sha,
                        pr_number: Some(pr),
                    },
                    force,
                )
                .await;
        }

        let ref_name = ref_name
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(repo.default_branch.as_str())
            .to_string();
        let sha = self.resolve_branch(&repo, &ref_name).await?;

        self.select(
            Candidate {
                repo_id: repo.id,
                trigger: BuildTrigger::Merge,
                ref_name,
                sha,
                pr_number: None,
            },
            force,
        )
        .await
    }

    /// Enqueues a manual build of the default branch tip, ignoring cooldown.
    pub async fn manual_build(&self, repo_id: RepositoryId) -> Result<Selection, SyncError> {
        let repo = self
            .enqueuer
            .store()
            .get_active_repository(repo_id)
            .ok_or(SyncError::RepoNotFound)?;
        if !self.source.has_credentials() {
            return Err(SyncError::MissingCredentials);
        }

        let sha = self.resolve_branch(&repo, &repo.default_branch).await?;
        self.select(
            Candidate {
                repo_id: repo.id,
                trigger: BuildTrigger::Manual,
                ref_name: repo.default_branch.clone(),
                sha,
                pr_number: None,
            },
            true,
        )
        .await
    }

    async fn resolve_branch(&self, repo: &Repository, branch: &str) -> Result<Sha, SyncError> {
        self.source
            .branch_tip(&repo.owner, &repo.name, branch)
            .await
            .map_err(|e| {
                error!(repo = %repo.full_name(), %branch, error = %e, "Failed to read branch");
                SyncError::BranchReadFailed(e)
            })?
            .ok_or(SyncError::ShaNotFound)
    }

    async fn select(
        &self,
        candidate: Candidate,
        ignore_cooldown: bool,
    ) -> Result<Selection, SyncError> {
        let ref_name = candidate.ref_name.clone();
        let sha = candidate.sha.clone();
        let outcome = self.enqueuer.enqueue(candidate, ignore_cooldown).await?;
        Ok(Selection {
            enqueued: outcome.created(),
            ref_name,
            sha,
        })
    }

    /// Offers a candidate during a pass. Store failures are logged, not raised.
    async fn offer(&self, candidate: Candidate, ignore_cooldown: bool) -> bool {
        match self.enqueuer.enqueue(candidate, ignore_cooldown).await {
            Ok(EnqueueOutcome::Created(_)) => true,
            Ok(EnqueueOutcome::Skipped(_)) => false,
            Err(e) => {
                error!(error = %e, "Failed to record enqueue");
                false
            }
        }
    }
}
