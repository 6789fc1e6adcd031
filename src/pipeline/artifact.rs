//! Locating the produced binary and promoting it to its stable location.
//!
//! ```text
//! <root>/<repo>/<pr number | ref>/<file>        promoted artifact
//! <root>/.staging/<repo>/<build id>/<file>      per-build staging
//! ```

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::types::Build;

/// Directories never searched for build output.
const SKIPPED_DIRS: [&str; 2] = [".git", "node_modules"];

const STAGING_DIR: &str = ".staging";

/// Makes `value` safe to use as a single path segment.
///
/// Each of `\ / : * ? " < > |` becomes `-`; surrounding whitespace is trimmed.
pub fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '-',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Finds files with `extension` (case-insensitive) at most `max_depth`
/// directories below `root`.
///
/// Results are ordered by depth, then by path, so the first entry is the
/// canonical pick. Symlinks are not followed. Unreadable subdirectories are
/// skipped; an unreadable `root` is an error.
pub async fn find_binaries(
    root: &Path,
    extension: &str,
    max_depth: usize,
) -> io::Result<Vec<PathBuf>> {
    let root = root.to_path_buf();
    let extension = extension.to_string();
    tokio::task::spawn_blocking(move || walk_for_binaries(&root, &extension, max_depth))
        .await
        .map_err(io::Error::other)?
}

fn walk_for_binaries(root: &Path, extension: &str, max_depth: usize) -> io::Result<Vec<PathBuf>> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        // Files directly in `root` are at walk depth 1.
        .max_depth(max_depth + 1)
        .sort_by(|a, b| a.file_name().cmp(b.file_name()))
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry));

    let mut found: Vec<(usize, PathBuf)> = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(err.into()),
            Err(err) => {
                debug!(%err, root = %root.display(), "Skipping path during binary search");
                continue;
            }
        };
        if entry.file_type().is_file() && has_extension(entry.path(), extension) {
            found.push((entry.depth(), entry.into_path()));
        }
    }

    found.sort();
    Ok(found.into_iter().map(|(_, path)| path).collect())
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

/// Artifact directory layout under one root.
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ArtifactLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<sanitized repo name>`; what stale-artifact GC scans.
    pub fn repo_dir(&self, repo_name: &str) -> PathBuf {
        self.root.join(sanitize_segment(repo_name))
    }

    pub fn staging_dir(&self, repo_name: &str, build: &Build) -> PathBuf {
        self.root
            .join(STAGING_DIR)
            .join(sanitize_segment(repo_name))
            .join(build.id.to_string())
    }

    /// PR builds land under the PR number, branch builds under the ref.
    pub fn final_dir(&self, repo_name: &str, build: &Build) -> PathBuf {
        let segment = match build.pr_number {
            Some(pr) => pr.0.to_string(),
            None => sanitize_segment(&build.ref_name),
        };
        self.repo_dir(repo_name).join(segment)
    }
}

/// Copies `binary` into `dir` (created if needed), returning the new path.
pub async fn copy_into(binary: &Path, dir: &Path) -> io::Result<PathBuf> {
    let file_name = binary
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "binary path has no file name"))?;
    tokio::fs::create_dir_all(dir).await?;
    let dest = dir.join(file_name);
    tokio::fs::copy(binary, &dest).await?;
    Ok(dest)
}

/// Removes a directory tree; a missing directory is fine.
pub async fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
