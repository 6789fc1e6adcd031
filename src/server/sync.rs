//! Operator triggers: targeted sync, repository resync, manual build.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{ApiError, AppState};
use crate::github::SourceControl;
use crate::sync::{Selection, SyncError};
use crate::types::{PrNumber, RepositoryId};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncNowRequest {
    #[serde(alias = "repoId")]
    pub repository_id: u64,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default, rename = "ref")]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryRequest {
    #[serde(alias = "repoId")]
    pub repository_id: u64,
}

/// `{ok, enqueued, ref, sha}` on success, `{ok:false, message}` otherwise.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued: Option<bool>,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SyncReply {
    fn done() -> Self {
        SyncReply {
            ok: true,
            ..Default::default()
        }
    }

    fn selected(selection: Selection) -> Self {
        SyncReply {
            ok: true,
            enqueued: Some(selection.enqueued),
            ref_name: Some(selection.ref_name),
            sha: Some(selection.sha.as_str().to_string()),
            message: None,
        }
    }

    /// Recoverable failures become a structured reply; store failures do not.
    fn from_error(e: SyncError) -> Result<Self, ApiError> {
        if let SyncError::Store(e) = e {
            return Err(e.into());
        }
        warn!(reason = e.reason(), error = %e, "Sync request failed");
        Ok(SyncReply {
            ok: false,
            message: Some(e.reason().to_string()),
            ..Default::default()
        })
    }
}

/// `POST /sync/now`.
pub async fn sync_now<S: SourceControl>(
    State(app): State<AppState<S>>,
    payload: Result<Json<SyncNowRequest>, JsonRejection>,
) -> Result<Json<SyncReply>, ApiError> {
    let Json(request) = payload?;
    let result = app
        .reconciler()
        .sync_selection(
            RepositoryId(request.repository_id),
            request.pr_number.map(PrNumber),
            request.ref_name.as_deref(),
            request.force,
        )
        .await;

    let reply = match result {
        Ok(selection) => SyncReply::selected(selection),
        Err(e) => SyncReply::from_error(e)?,
    };
    Ok(Json(reply))
}

/// `POST /sync/repo`: full resync of one repository, cooldown ignored.
pub async fn sync_repo<S: SourceControl>(
    State(app): State<AppState<S>>,
    payload: Result<Json<RepositoryRequest>, JsonRejection>,
) -> Result<Json<SyncReply>, ApiError> {
    let Json(request) = payload?;
    let reply = match app
        .reconciler()
        .sync_repository(RepositoryId(request.repository_id))
        .await
    {
        Ok(_) => SyncReply::done(),
        Err(e) => SyncReply::from_error(e)?,
    };
    Ok(Json(reply))
}

/// `POST /builds/manual`: queue a MANUAL build of the default branch tip.
pub async fn manual_build<S: SourceControl>(
    State(app): State<AppState<S>>,
    payload: Result<Json<RepositoryRequest>, JsonRejection>,
) -> Result<Json<SyncReply>, ApiError> {
    let Json(request) = payload?;
    let reply = match app
        .reconciler()
        .manual_build(RepositoryId(request.repository_id))
        .await
    {
        Ok(selection) => SyncReply::selected(selection),
        Err(e) => SyncReply::from_error(e)?,
    };
    Ok(Json(reply))
}
