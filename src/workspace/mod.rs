//! Per-repository mirrors and per-build worktrees.
//!
//! Each repository has one bare mirror clone that every build of that
//! repository fetches into. Each build checks out its target into a private
//! worktree of that mirror, so concurrent builds share fetch history but never
//! a working directory.
//!
//! Layout under the workspace root:
//!
//! ```text
//! <root>/<owner>/<name>/clone/               mirror
//! <root>/<owner>/<name>/worktrees/build-<id>  one per running build
//! ```
//!
//! Owner and name are single path segments; registration rejects anything
//! else, so two repositories never share a directory.
//!
//! All worktrees are created in detached HEAD mode so the same branch can be
//! checked out by several builds at once.

mod mirror;
mod worktree;

use std::path::{Path, PathBuf};
use std::process::Output;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::types::{BuildId, PrNumber, Repository};

pub use mirror::MirrorSync;

/// Errors from workspace operations.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Git command failed.
    #[error("git command failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    /// Neither the target nor `origin/<target>` could be checked out.
    #[error("cannot check out {target}: {details}")]
    CheckoutFailed { target: String, details: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of preparing a build's workspace.
///
/// Mirror synchronisation and the PR head fetch are recorded rather than
/// fatal; only the worktree decides whether the build can proceed.
#[derive(Debug)]
pub struct Preparation {
    pub mirror_dir: PathBuf,
    pub mirror: Result<MirrorSync, WorkspaceError>,
    pub pr_head: Option<Result<(), WorkspaceError>>,
    pub worktree: Result<PathBuf, WorkspaceError>,
}

/// Owns the workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        WorkspaceManager { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<owner>/<name>`.
    pub fn repo_dir(&self, repo: &Repository) -> PathBuf {
        self.root.join(&repo.owner).join(&repo.name)
    }

    pub fn mirror_dir(&self, repo: &Repository) -> PathBuf {
        self.repo_dir(repo).join("clone")
    }

    pub fn worktrees_dir(&self, repo: &Repository) -> PathBuf {
        self.repo_dir(repo).join("worktrees")
    }

    pub fn worktree_path(&self, repo: &Repository, build_id: BuildId) -> PathBuf {
        self.worktrees_dir(repo).join(format!("build-{}", build_id.0))
    }

    /// Brings the mirror up to date and checks `target` out into a fresh
    /// worktree for `build_id`.
    ///
    /// 1. Clone the mirror if absent, otherwise `fetch --all --prune`.
    /// 2. For PR builds, fetch `pull/<n>/head` so fork commits resolve.
    /// 3. Remove any worktree left at this build's path by a crash.
    /// 4. Add the worktree at `target`, retrying with `origin/<target>`.
    pub async fn prepare(
        &self,
        repo: &Repository,
        target: &str,
        pr: Option<PrNumber>,
        build_id: BuildId,
    ) -> Preparation {
        let mirror_dir = self.mirror_dir(repo);

        let mirror = mirror::clone_or_fetch(&mirror_dir, &repo.clone_url).await;
        match &mirror {
            Ok(action) => debug!(repo = %repo.full_name(), ?action, "Mirror synced"),
            Err(e) => warn!(repo = %repo.full_name(), error = %e, "Mirror sync failed"),
        }

        let pr_head = match pr {
            Some(pr) if mirror_dir.exists() => Some(mirror::fetch_pr_head(&mirror_dir, pr).await),
            _ => None,
        };

        let path = self.worktree_path(repo, build_id);
        let worktree = async {
            worktree::remove(&mirror_dir, &path).await?;
            worktree::add_detached(&mirror_dir, &path, target).await?;
            Ok(path)
        }
        .await;

        if let Ok(path) = &worktree {
            info!(
                repo = %repo.full_name(),
                build_id = %build_id,
                target,
                path = %path.display(),
                "Worktree ready"
            );
        }

        Preparation {
            mirror_dir,
            mirror,
            pr_head,
            worktree,
        }
    }

    /// Unregisters and deletes a build's worktree. Idempotent.
    pub async fn cleanup_worktree(
        &self,
        mirror_dir: &Path,
        worktree_dir: &Path,
    ) -> Result<(), WorkspaceError> {
        worktree::remove(mirror_dir, worktree_dir).await
    }

    /// The commit checked out in `worktree_dir`.
    pub async fn head_commit(&self, worktree_dir: &Path) -> Result<String, WorkspaceError> {
        run_git_stdout(worktree_dir, &["rev-parse", "HEAD"]).await
    }

    /// Removes every build worktree under the root.
    ///
    /// Only safe when no build is running, i.e. at startup.
    pub async fn remove_leftover_worktrees(&self) -> Result<Vec<PathBuf>, WorkspaceError> {
        let mut removed = Vec::new();
        for owner_dir in subdirectories(&self.root).await? {
            for repo_dir in subdirectories(&owner_dir).await? {
                let mirror_dir = repo_dir.join("clone");
                let worktrees_dir = repo_dir.join("worktrees");
                for path in worktree::list_build_worktrees(&worktrees_dir).await? {
                    worktree::remove(&mirror_dir, &path).await?;
                    info!(path = %path.display(), "Removed leftover worktree");
                    removed.push(path);
                }
            }
        }

        Ok(removed)
    }
}

/// Directories directly inside `dir`; none if `dir` does not exist.
async fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, WorkspaceError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

/// Create a git command with a clean environment (no system/user config,
/// no prompts).
pub(crate) fn git_command(workdir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(workdir);
    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.kill_on_drop(true);
    cmd
}

/// Runs git in `workdir`, failing on a non-zero exit.
pub(crate) async fn run_git(workdir: &Path, args: &[&str]) -> Result<Output, WorkspaceError> {
    let output = git_command(workdir).args(args).output().await?;

    if output.status.success() {
        Ok(output)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let command = format!("git {}", args.join(" "));
        Err(WorkspaceError::CommandFailed { command, stderr })
    }
}

/// Runs git and returns trimmed stdout.
pub(crate) async fn run_git_stdout(
    workdir: &Path,
    args: &[&str],
) -> Result<String, WorkspaceError> {
    let output = run_git(workdir, args).await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
