//! Build listing and lookup.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::github::SourceControl;
use crate::store::BuildFilter;
use crate::types::{Build, BuildId, BuildStatus, RepositoryId};

const LIST_LIMIT: usize = 50;

/// Query parameters arrive as raw strings so a non-numeric `repoId` can be
/// ignored instead of rejecting the request.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildQuery {
    pub repo_id: Option<String>,
    pub status: Option<String>,
}

impl BuildQuery {
    fn filter(&self) -> Result<BuildFilter, ApiError> {
        let repo_id = self
            .repo_id
            .as_deref()
            .and_then(|id| id.trim().parse().ok())
            .map(RepositoryId);

        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                BuildStatus::parse(raw)
                    .ok_or_else(|| ApiError::BadRequest(format!("unknown status: {}", raw)))?,
            ),
        };

        Ok(BuildFilter { repo_id, status })
    }
}

/// `GET /builds?repoId=&status=`: newest 50 first.
pub async fn list_builds<S: SourceControl>(
    State(app): State<AppState<S>>,
    Query(query): Query<BuildQuery>,
) -> Result<Json<Vec<Build>>, ApiError> {
    let filter = query.filter()?;
    Ok(Json(app.store().list_builds(filter, LIST_LIMIT)))
}

/// `GET /builds/{id}`, including the log.
pub async fn get_build<S: SourceControl>(
    State(app): State<AppState<S>>,
    Path(id): Path<u64>,
) -> Result<Json<Build>, ApiError> {
    app.store()
        .get_build(BuildId(id))
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}
