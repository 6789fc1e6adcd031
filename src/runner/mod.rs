//! The runner: claims queued builds and drives each one to a terminal status.
//!
//! Per build: QUEUED -> claimed (RUNNING) -> prepare workspace -> pipeline ->
//! SUCCESS | FAILED, with the worktree removed afterwards on every path.
//! Nothing that goes wrong inside a build escapes [`Runner::run_build`]; it
//! ends up in the build's status and log instead.

mod scheduler;

use tracing::{error, info, warn};

use crate::pipeline::{BuildLogger, BuildPipeline, PipelineOutcome};
use crate::store::{Store, StoreError};
use crate::types::{Build, BuildId, BuildStatus, BuildTrigger, Repository};
use crate::workspace::{MirrorSync, WorkspaceManager};

pub use scheduler::{Scheduler, SchedulerConfig};

const INTERRUPTED: &str = "Build interrupted by a restart; marked as failed.";

/// What startup recovery cleaned up.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub failed_builds: Vec<BuildId>,
    pub removed_worktrees: usize,
}

pub struct Runner {
    store: Store,
    workspace: WorkspaceManager,
    pipeline: BuildPipeline,
}

impl Runner {
    pub fn new(store: Store, workspace: WorkspaceManager, pipeline: BuildPipeline) -> Self {
        Runner {
            store,
            workspace,
            pipeline,
        }
    }

    /// Fails builds a previous process left running and deletes their
    /// worktrees. Must run before any build is claimed.
    pub async fn recover(&self) -> Recovery {
        let mut recovery = Recovery::default();

        match self.store.fail_running_builds(INTERRUPTED).await {
            Ok(ids) => {
                if !ids.is_empty() {
                    warn!(count = ids.len(), "Failed builds interrupted by restart");
                }
                recovery.failed_builds = ids;
            }
            Err(e) => error!(error = %e, "Failed to recover running builds"),
        }

        match self.workspace.remove_leftover_worktrees().await {
            Ok(removed) => recovery.removed_worktrees = removed.len(),
            Err(e) => error!(error = %e, "Failed to remove leftover worktrees"),
        }

        recovery
    }

    /// Claims the oldest queued build, if any.
    pub async fn claim_next(&self) -> Option<(Build, Repository)> {
        match self.store.claim_next_queued().await {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(error = %e, "Failed to claim queued build");
                None
            }
        }
    }

    /// Drives a claimed build to completion and returns its final status.
    pub async fn run_build(&self, build: Build, repo: Repository) -> BuildStatus {
        let logger = BuildLogger::new(self.store.clone(), &build);
        info!(
            build_id = %build.id,
            repo = %repo.full_name(),
            trigger = %build.trigger,
            sha = %build.commit_sha.short(),
            "Running build"
        );

        // Manual builds follow the branch; everything else pins the commit.
        let target = match build.trigger {
            BuildTrigger::Manual => repo.default_branch.clone(),
            BuildTrigger::Pr | BuildTrigger::Merge => build.commit_sha.as_str().to_string(),
        };
        record(logger.log(format!("Preparing workspace for {}", target)).await);

        let prep = self
            .workspace
            .prepare(&repo, &target, build.pr_number, build.id)
            .await;
        match &prep.mirror {
            Ok(MirrorSync::Cloned) => record(logger.log(format!("Cloned {}", repo.clone_url)).await),
            Ok(MirrorSync::Fetched) => record(logger.log("Fetched latest changes").await),
            Err(e) => record(logger.error(format!("Mirror sync failed: {}", e)).await),
        }
        if let Some(Err(e)) = &prep.pr_head {
            record(logger.log(format!("Could not fetch PR head: {}", e)).await);
        }

        let status = match &prep.worktree {
            Err(e) => {
                record(logger.error(format!("Workspace preparation failed: {}", e)).await);
                self.fail(build.id).await
            }
            Ok(worktree) => {
                match self.workspace.head_commit(worktree).await {
                    Ok(head) => record(logger.log(format!("Checked out {}", head)).await),
                    Err(e) => warn!(build_id = %build.id, error = %e, "Could not read worktree HEAD"),
                }

                // A separate task so a panicking pipeline still reaches cleanup.
                let pipeline = self.pipeline.clone();
                let (b, r, dir) = (build.clone(), repo.clone(), worktree.clone());
                let handle = tokio::spawn(async move { pipeline.run(&b, &r, &dir).await });

                match handle.await {
                    Ok(Ok(PipelineOutcome::Succeeded { .. })) => BuildStatus::Success,
                    Ok(Ok(PipelineOutcome::Failed { .. })) => BuildStatus::Failed,
                    Ok(Err(e)) => {
                        record(logger.error(format!("Build error: {}", e)).await);
                        self.fail(build.id).await
                    }
                    Err(e) => {
                        record(logger.error(format!("Build task aborted: {}", e)).await);
                        self.fail(build.id).await
                    }
                }
            }
        };

        let worktree = self.workspace.worktree_path(&repo, build.id);
        if let Err(e) = self
            .workspace
            .cleanup_worktree(&prep.mirror_dir, &worktree)
            .await
        {
            warn!(build_id = %build.id, error = %e, "Worktree cleanup failed");
            record(logger.log(format!("Worktree cleanup failed: {}", e)).await);
        }

        info!(build_id = %build.id, status = %status, "Build finished");
        status
    }

    async fn fail(&self, id: BuildId) -> BuildStatus {
        if let Err(e) = self.store.set_status(id, BuildStatus::Failed).await {
            warn!(build_id = %id, error = %e, "Could not mark build failed");
        }
        BuildStatus::Failed
    }
}

/// Build log writes are best effort once a build is underway.
fn record(result: Result<(), StoreError>) {
    if let Err(e) = result {
        warn!(error = %e, "Failed to append build log");
    }
}
