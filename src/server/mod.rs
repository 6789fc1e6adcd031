//! HTTP surface.
//!
//! # Endpoints
//!
//! - `POST /webhooks/github` - GitHub deliveries (always 200)
//! - `POST /sync/now` - evaluate one PR or branch
//! - `POST /sync/repo` - resync one repository, cooldown ignored
//! - `POST /repos`, `GET /repos`, `DELETE /repos/{id}` - repository registry
//! - `GET /builds`, `GET /builds/{id}` - build listing and lookup
//! - `POST /builds/manual` - queue a manual build of the default branch
//! - `GET /health` - liveness

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::github::SourceControl;
use crate::store::{Store, StoreError};
use crate::sync::Reconciler;
use crate::webhooks::WebhookIngester;

pub mod builds;
pub mod health;
pub mod repos;
pub mod sync;
pub mod webhook;

pub use health::health_handler;
pub use webhook::webhook_handler;

/// Errors surfaced by the admin endpoints as `{ok:false, message}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),

    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_)
            | ApiError::InvalidBody(_)
            | ApiError::Store(StoreError::InvalidRepository(_)) => StatusCode::BAD_REQUEST,
            ApiError::NotFound
            | ApiError::Store(StoreError::BuildNotFound(_))
            | ApiError::Store(StoreError::RepositoryNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::RepositoryExists { .. }) => StatusCode::CONFLICT,
            ApiError::Store(_) => {
                error!(error = %self, "Store failure while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({ "ok": false, "message": self.to_string() }));
        (status, body).into_response()
    }
}

/// Shared handler state.
pub struct AppState<S> {
    inner: Arc<AppStateInner<S>>,
}

struct AppStateInner<S> {
    store: Store,
    ingester: WebhookIngester,
    reconciler: Arc<Reconciler<S>>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        AppState {
            inner: self.inner.clone(),
        }
    }
}

impl<S: SourceControl> AppState<S> {
    pub fn new(store: Store, ingester: WebhookIngester, reconciler: Arc<Reconciler<S>>) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                store,
                ingester,
                reconciler,
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn ingester(&self) -> &WebhookIngester {
        &self.inner.ingester
    }

    pub fn reconciler(&self) -> &Reconciler<S> {
        &self.inner.reconciler
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<S: SourceControl>(app_state: AppState<S>) -> axum::Router {
    use axum::routing::{delete, get, post};

    axum::Router::new()
        .route("/webhooks/github", post(webhook_handler::<S>))
        .route("/sync/now", post(sync::sync_now::<S>))
        .route("/sync/repo", post(sync::sync_repo::<S>))
        .route(
            "/repos",
            post(repos::create_repository::<S>).get(repos::list_repositories::<S>),
        )
        .route("/repos/{id}", delete(repos::delete_repository::<S>))
        .route("/builds", get(builds::list_builds::<S>))
        .route("/builds/manual", post(sync::manual_build::<S>))
        .route("/builds/{id}", get(builds::get_build::<S>))
        .route("/health", get(health_handler))
        .with_state(app_state)
}

#[cfg(test)]
mod integration_tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::enqueue::Enqueuer;
    use crate::github::fake::{FakeSourceControl, pull};
    use crate::types::{BuildStatus, BuildTrigger, NewRepository, Repository};
    use crate::webhooks::sign;

    const SECRET: &str = "hook-secret";

    struct TestApp {
        app: axum::Router,
        store: Store,
        source: Arc<FakeSourceControl>,
        repo: Repository,
        _artifacts: TempDir,
    }

    impl TestApp {
        async fn new() -> Self {
            Self::with_source(FakeSourceControl::default()).await
        }

        async fn with_source(source: FakeSourceControl) -> Self {
            let store = Store::in_memory();
            let repo = store
                .create_repository(NewRepository::new("acme", "app"))
                .await
                .unwrap();
            let source = Arc::new(source);
            source.set_tip("acme", "app", "main", "abc123");

            let artifacts = TempDir::new().unwrap();
            let enqueuer = Enqueuer::new(store.clone(), Duration::from_secs(60));
            let reconciler = Arc::new(Reconciler::new(
                enqueuer.clone(),
                source.clone(),
                artifacts.path(),
            ));
            let ingester = WebhookIngester::new(enqueuer, Some(SECRET.to_string()));
            let app = build_router(AppState::new(store.clone(), ingester, reconciler));

            TestApp {
                app,
                store,
                source,
                repo,
                _artifacts: artifacts,
            }
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = self.app.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body = serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
            (status, body)
        }

        async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
            let request = Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap();
            self.send(request).await
        }

        async fn get(&self, uri: &str) -> (StatusCode, Value) {
            self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
        }
    }

    fn webhook(event: &str, body: &Value, secret: &str) -> Request<Body> {
        let bytes = serde_json::to_vec(body).unwrap();
        let signature = sign(&bytes, secret.as_bytes()).unwrap();
        Request::builder()
            .method("POST")
            .uri("/webhooks/github")
            .header("content-type", "application/json")
            .header("x-github-event", event)
            .header("x-github-delivery", "d-1")
            .header("x-hub-signature-256", signature)
            .body(Body::from(bytes))
            .unwrap()
    }

    fn push(after: &str) -> Value {
        json!({
            "ref": "refs/heads/main",
            "after": after,
            "repository": { "name": "app", "owner": { "login": "acme" } }
        })
    }

    // ─── Health ───

    #[tokio::test]
    async fn health_returns_ok() {
        let t = TestApp::new().await;
        let (status, body) = t.get("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("OK".to_string()));
    }

    // ─── Webhooks ───

    #[tokio::test]
    async fn signed_push_creates_merge_build() {
        let t = TestApp::new().await;

        let (status, body) = t.send(webhook("push", &push("abc123"), SECRET)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));

        let builds = t.store.list_builds(Default::default(), 50);
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].trigger, BuildTrigger::Merge);
        assert_eq!(builds[0].ref_name, "main");
        assert_eq!(builds[0].commit_sha.as_str(), "abc123");

        let (status, _) = t.send(webhook("push", &push("abc123"), SECRET)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(t.store.list_builds(Default::default(), 50).len(), 1);
    }

    #[tokio::test]
    async fn bad_signature_is_acknowledged_but_ignored() {
        let t = TestApp::new().await;

        let (status, body) = t.send(webhook("push", &push("abc123"), "wrong")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true, "ignored": true }));
        assert!(t.store.list_builds(Default::default(), 50).is_empty());
    }

    #[tokio::test]
    async fn missing_headers_are_acknowledged_but_ignored() {
        let t = TestApp::new().await;
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/github")
            .body(Body::from(push("abc123").to_string()))
            .unwrap();

        let (status, body) = t.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ignored"], json!(true));
    }

    // ─── Sync ───

    #[tokio::test]
    async fn sync_now_defaults_to_the_default_branch() {
        let t = TestApp::new().await;

        let (status, body) = t.post("/sync/now", json!({ "repositoryId": t.repo.id.0 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({ "ok": true, "enqueued": true, "ref": "main", "sha": "abc123" })
        );
    }

    #[tokio::test]
    async fn sync_now_force_bypasses_cooldown() {
        let t = TestApp::new().await;
        t.post("/sync/now", json!({ "repoId": t.repo.id.0 })).await;
        t.source.set_tip("acme", "app", "main", "def456");

        let (_, body) = t.post("/sync/now", json!({ "repositoryId": t.repo.id.0 })).await;
        assert_eq!(body["enqueued"], json!(false));

        let (_, body) = t
            .post("/sync/now", json!({ "repositoryId": t.repo.id.0, "force": true }))
            .await;
        assert_eq!(body["enqueued"], json!(true));
        assert_eq!(body["sha"], json!("def456"));
    }

    #[tokio::test]
    async fn sync_now_pr_path() {
        let t = TestApp::new().await;
        t.source
            .set_pulls("acme", "app", vec![pull(8, "fff000", "feature")]);

        let (_, body) = t
            .post("/sync/now", json!({ "repositoryId": t.repo.id.0, "prNumber": 8 }))
            .await;
        assert_eq!(
            body,
            json!({ "ok": true, "enqueued": true, "ref": "feature", "sha": "fff000" })
        );

        let (status, body) = t
            .post("/sync/now", json!({ "repositoryId": t.repo.id.0, "prNumber": 9 }))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": false, "message": "pr_not_found" }));
    }

    #[tokio::test]
    async fn sync_now_reports_unknown_repository() {
        let t = TestApp::new().await;
        let (status, body) = t.post("/sync/now", json!({ "repositoryId": 404 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": false, "message": "repo_not_found" }));
    }

    #[tokio::test]
    async fn sync_now_rejects_malformed_body() {
        let t = TestApp::new().await;
        let (status, body) = t.post("/sync/now", json!({ "repositoryId": "abc" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], json!(false));
    }

    #[tokio::test]
    async fn missing_credentials_are_reported() {
        let t = TestApp::with_source(FakeSourceControl::anonymous()).await;
        let (_, body) = t.post("/sync/now", json!({ "repositoryId": t.repo.id.0 })).await;
        assert_eq!(body, json!({ "ok": false, "message": "missing_credentials" }));
    }

    #[tokio::test]
    async fn sync_repo_enqueues_prs_and_branch() {
        let t = TestApp::new().await;
        t.source
            .set_pulls("acme", "app", vec![pull(3, "aaa111", "feature")]);

        let (status, body) = t.post("/sync/repo", json!({ "repositoryId": t.repo.id.0 })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));
        assert_eq!(t.store.list_builds(Default::default(), 50).len(), 2);
    }

    #[tokio::test]
    async fn manual_build_is_queued_with_manual_trigger() {
        let t = TestApp::new().await;
        let (_, body) = t
            .post("/builds/manual", json!({ "repositoryId": t.repo.id.0 }))
            .await;
        assert_eq!(body["enqueued"], json!(true));

        let builds = t.store.list_builds(Default::default(), 50);
        assert_eq!(builds[0].trigger, BuildTrigger::Manual);
    }

    // ─── Repositories ───

    #[tokio::test]
    async fn repository_registry_round() {
        let t = TestApp::new().await;

        let (status, created) = t
            .post(
                "/repos",
                json!({ "owner": "acme", "name": "lib", "useLegacyPeerDeps": true }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["cloneUrl"], json!("https://github.com/acme/lib.git"));
        assert_eq!(created["defaultBranch"], json!("main"));
        assert_eq!(created["useLegacyPeerDeps"], json!(true));

        let (status, _) = t.post("/repos", json!({ "owner": "acme", "name": "lib" })).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, listed) = t.get("/repos").await;
        assert_eq!(listed[0]["name"], json!("lib"));
        assert_eq!(listed[1]["name"], json!("app"));

        let id = created["id"].as_u64().unwrap();
        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/repos/{}", id))
            .body(Body::empty())
            .unwrap();
        let (status, deleted) = t.send(request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(deleted["isActive"], json!(false));
    }

    #[tokio::test]
    async fn repository_validation() {
        let t = TestApp::new().await;
        let (status, _) = t.post("/repos", json!({ "owner": " ", "name": "x" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = t.post("/repos", json!({ "owner": "a", "name": "b/c" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], json!(false));
        assert!(t.store.find_active_repository("a", "b/c").is_none());

        let request = Request::builder()
            .method("DELETE")
            .uri("/repos/999")
            .body(Body::empty())
            .unwrap();
        let (status, _) = t.send(request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    // ─── Builds ───

    #[tokio::test]
    async fn build_listing_and_lookup() {
        let t = TestApp::new().await;
        t.send(webhook("push", &push("abc123"), SECRET)).await;
        let id = t.store.list_builds(Default::default(), 1)[0].id;

        let (_, all) = t.get(&format!("/builds?repoId={}", t.repo.id.0)).await;
        assert_eq!(all.as_array().unwrap().len(), 1);
        assert_eq!(all[0]["ref"], json!("main"));
        assert_eq!(all[0]["status"], json!(BuildStatus::Queued.to_string()));

        let (_, none) = t.get("/builds?status=SUCCESS").await;
        assert!(none.as_array().unwrap().is_empty());

        let (status, _) = t.get("/builds?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, one) = t.get(&format!("/builds/{}", id.0)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(one["commitSha"], json!("abc123"));

        let (status, _) = t.get("/builds/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
