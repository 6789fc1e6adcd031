//! The per-repository mirror clone.
//!
//! Mirrors are bare `git clone --mirror` repositories: every fetch rewrites
//! `refs/heads/*` (and GitHub's `refs/pull/*`) to match upstream, so a branch
//! name resolves to the current remote tip without a separate tracking ref.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::{WorkspaceError, run_git};
use crate::types::PrNumber;

/// What [`clone_or_fetch`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorSync {
    Cloned,
    Fetched,
}

/// Distinguishes concurrent clone attempts within one process.
static CLONE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Clones `url` into `mirror_dir` if it is absent, otherwise fetches all
/// remotes with pruning.
///
/// The clone is made beside `mirror_dir` and renamed into place, so a
/// concurrent preparation never sees a half-cloned mirror. When two clones
/// race, the loser discards its copy.
pub(super) async fn clone_or_fetch(
    mirror_dir: &Path,
    url: &str,
) -> Result<MirrorSync, WorkspaceError> {
    if mirror_dir.exists() {
        run_git(mirror_dir, &["fetch", "--all", "--prune"]).await?;
        return Ok(MirrorSync::Fetched);
    }

    let parent = mirror_dir.parent().unwrap_or(Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let staging = parent.join(format!(
        ".clone-{}-{}",
        std::process::id(),
        CLONE_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let target = staging.to_string_lossy();
    if let Err(e) = run_git(parent, &["clone", "--mirror", url, &target]).await {
        discard(&staging).await;
        return Err(e);
    }

    match tokio::fs::rename(&staging, mirror_dir).await {
        Ok(()) => Ok(MirrorSync::Cloned),
        Err(_) if mirror_dir.exists() => {
            debug!(mirror = %mirror_dir.display(), "Lost clone race, using existing mirror");
            discard(&staging).await;
            Ok(MirrorSync::Cloned)
        }
        Err(e) => {
            discard(&staging).await;
            Err(e.into())
        }
    }
}

async fn discard(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %dir.display(), error = %e, "Could not remove clone staging directory");
    }
}

/// Fetches `pull/<n>/head` so commits that only exist on a fork resolve.
pub(super) async fn fetch_pr_head(mirror_dir: &Path, pr: PrNumber) -> Result<(), WorkspaceError> {
    let refspec = format!("pull/{}/head", pr.0);
    run_git(mirror_dir, &["fetch", "origin", &refspec]).await?;
    Ok(())
}
