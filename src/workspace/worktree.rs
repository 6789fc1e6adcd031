//! Per-build worktrees of a mirror.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::{WorkspaceError, run_git};

/// Unregisters and deletes the worktree at `path`.
///
/// Idempotent: a missing directory is fine, and a directory git no longer
/// knows about is deleted from disk directly.
pub(super) async fn remove(mirror_dir: &Path, path: &Path) -> Result<(), WorkspaceError> {
    let mirror_exists = mirror_dir.exists();

    if path.exists() {
        if mirror_exists {
            let target = path.to_string_lossy();
            if let Err(e) = run_git(mirror_dir, &["worktree", "remove", "--force", &target]).await
            {
                debug!(path = %path.display(), error = %e, "git worktree remove failed");
            }
        }
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
    }

    if mirror_exists {
        run_git(mirror_dir, &["worktree", "prune"]).await?;
    }
    Ok(())
}

/// Adds a detached worktree at `path` checked out at `target`, retrying with
/// `origin/<target>` when `target` does not resolve.
pub(super) async fn add_detached(
    mirror_dir: &Path,
    path: &Path,
    target: &str,
) -> Result<(), WorkspaceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let dest = path.to_string_lossy();

    let direct = match run_git(mirror_dir, &["worktree", "add", "--detach", &dest, target]).await {
        Ok(_) => return Ok(()),
        Err(e) => e,
    };

    let tracking = format!("origin/{}", target);
    match run_git(mirror_dir, &["worktree", "add", "--detach", &dest, &tracking]).await {
        Ok(_) => {
            debug!(target, "Checked out remote-tracking ref");
            Ok(())
        }
        Err(fallback) => Err(WorkspaceError::CheckoutFailed {
            target: target.to_string(),
            details: format!("{}; {}", direct, fallback),
        }),
    }
}

/// Lists `build-<n>` directories under `worktrees_dir`, sorted.
pub(super) async fn list_build_worktrees(
    worktrees_dir: &Path,
) -> Result<Vec<PathBuf>, WorkspaceError> {
    let mut entries = match tokio::fs::read_dir(worktrees_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let is_build_dir = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_prefix("build-"))
            .is_some_and(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()));
        if is_build_dir && entry.file_type().await?.is_dir() {
            found.push(entry.path());
        }
    }

    found.sort();
    Ok(found)
}
