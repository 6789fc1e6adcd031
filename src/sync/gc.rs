//! Stale PR artifact removal.
//!
//! PR artifacts live in `<artifact root>/<repo>/<pr number>/`. Once a PR is no
//! longer open its folder is dead weight; reconciliation removes it.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use tracing::info;

use crate::types::PrNumber;

/// Removes every numeric subdirectory of `repo_dir` whose number is not in
/// `open`. Non-numeric entries (branch artifacts) and files are left alone.
///
/// Returns the PR numbers whose folders were removed. A missing `repo_dir`
/// means there is nothing to collect.
pub async fn remove_closed_pr_artifacts(
    repo_dir: &Path,
    open: &HashSet<PrNumber>,
) -> io::Result<Vec<PrNumber>> {
    let mut entries = match tokio::fs::read_dir(repo_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut removed = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(number) = name.to_str().and_then(parse_pr_folder) else {
            continue;
        };
        if open.contains(&number) {
            continue;
        }

        let path = entry.path();
        tokio::fs::remove_dir_all(&path).await?;
        info!(path = %path.display(), pr = %number, "Removed closed PR artifacts");
        removed.push(number);
    }

    removed.sort();
    Ok(removed)
}

/// Accepts only all-digit folder names.
fn parse_pr_folder(name: &str) -> Option<PrNumber> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok().map(PrNumber)
}
