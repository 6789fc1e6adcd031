//! Repository registry endpoints.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use tracing::info;

use super::{ApiError, AppState};
use crate::github::SourceControl;
use crate::types::{NewRepository, Repository, RepositoryId};

/// `POST /repos`
pub async fn create_repository<S: SourceControl>(
    State(app): State<AppState<S>>,
    payload: Result<Json<NewRepository>, JsonRejection>,
) -> Result<(StatusCode, Json<Repository>), ApiError> {
    let Json(mut input) = payload?;
    input.owner = input.owner.trim().to_string();
    input.name = input.name.trim().to_string();
    if input.owner.is_empty() || input.name.is_empty() {
        return Err(ApiError::BadRequest(
            "owner and name are required".to_string(),
        ));
    }

    let repo = app.store().create_repository(input).await?;
    info!(repo_id = %repo.id, repo = %repo.full_name(), "Registered repository");
    Ok((StatusCode::CREATED, Json(repo)))
}

/// `GET /repos`, newest first.
pub async fn list_repositories<S: SourceControl>(
    State(app): State<AppState<S>>,
) -> Json<Vec<Repository>> {
    Json(app.store().list_repositories())
}

/// `DELETE /repos/{id}`: deactivates; history is kept.
pub async fn delete_repository<S: SourceControl>(
    State(app): State<AppState<S>>,
    Path(id): Path<u64>,
) -> Result<Json<Repository>, ApiError> {
    let repo = app.store().deactivate_repository(RepositoryId(id)).await?;
    info!(repo_id = %repo.id, repo = %repo.full_name(), "Deactivated repository");
    Ok(Json(repo))
}
