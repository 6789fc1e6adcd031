//! Registered repositories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RepositoryId;

/// A repository the builder tracks.
///
/// Identity is `(owner, name)`. Repositories are deactivated rather than
/// deleted in normal operation; inactive repositories are skipped by
/// reconciliation and by webhook ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: RepositoryId,
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    pub default_branch: String,
    pub is_active: bool,

    /// Replaces the lockfile-driven install command when set.
    pub install_command: Option<String>,

    /// Replaces the package-manager build command when set.
    pub build_command: Option<String>,

    /// Appends `--legacy-peer-deps` to npm-based install commands.
    pub use_legacy_peer_deps: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Repository {
    /// Returns `owner/name` for logging.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Input for registering a repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRepository {
    pub owner: String,
    pub name: String,
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub use_legacy_peer_deps: bool,
}

impl NewRepository {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        NewRepository {
            owner: owner.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Checks that owner and name are each a single plain path segment.
    ///
    /// Both become directories under the workspace root, so separators, `.`,
    /// `..`, and control characters are refused.
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [("owner", &self.owner), ("name", &self.name)] {
            if value.is_empty() {
                return Err(format!("{} is required", field));
            }
            if value == "." || value == ".." {
                return Err(format!("{} may not be {:?}", field, value));
            }
            if value
                .chars()
                .any(|c| c == '/' || c == '\\' || c.is_control())
            {
                return Err(format!("{} may not contain path separators: {:?}", field, value));
            }
        }
        Ok(())
    }

    /// Materializes the record, filling defaults for the clone URL and branch.
    pub(crate) fn into_repository(self, id: RepositoryId, now: DateTime<Utc>) -> Repository {
        let clone_url = self
            .clone_url
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| format!("https://github.com/{}/{}.git", self.owner, self.name));
        let default_branch = self
            .default_branch
            .filter(|branch| !branch.trim().is_empty())
            .unwrap_or_else(|| "main".to_string());

        Repository {
            id,
            owner: self.owner,
            name: self.name,
            clone_url,
            default_branch,
            is_active: true,
            install_command: self.install_command,
            build_command: self.build_command,
            use_legacy_peer_deps: self.use_legacy_peer_deps,
            created_at: now,
            updated_at: now,
        }
    }
}
