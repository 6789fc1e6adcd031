//! Webhook fast path into the enqueuer.

use tracing::{debug, info, warn};

use super::events::{EventKind, parse_event};
use super::signature::verify_signature;
use crate::enqueue::{Candidate, EnqueueOutcome, Enqueuer};
use crate::types::BuildTrigger;

/// What happened to a delivery. Callers see success either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A candidate reached the enqueuer (whether or not it created a build).
    Processed,
    Ignored,
}

/// Headers that accompany a delivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct Delivery<'a> {
    pub event: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub delivery_id: Option<&'a str>,
}

/// Verifies deliveries and feeds the resulting candidates to the enqueuer.
#[derive(Debug, Clone)]
pub struct WebhookIngester {
    enqueuer: Enqueuer,
    secret: Option<Vec<u8>>,
}

impl WebhookIngester {
    pub fn new(enqueuer: Enqueuer, secret: Option<String>) -> Self {
        WebhookIngester {
            enqueuer,
            secret: secret.filter(|s| !s.is_empty()).map(String::into_bytes),
        }
    }

    /// Handles one delivery. Nothing here is surfaced to the sender: bad
    /// signatures, unknown events, and store failures all end as `Ignored`.
    pub async fn handle(&self, raw_body: &[u8], delivery: Delivery<'_>) -> IngestOutcome {
        let delivery_id = delivery.delivery_id.unwrap_or("-");

        if !verify_signature(raw_body, delivery.signature, self.secret.as_deref()) {
            warn!(delivery = delivery_id, "Webhook signature rejected");
            return IngestOutcome::Ignored;
        }

        let event_type = delivery.event.unwrap_or_default();
        let event = match parse_event(event_type, raw_body) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(delivery = delivery_id, event = event_type, "Ignoring event");
                return IngestOutcome::Ignored;
            }
            Err(e) => {
                warn!(delivery = delivery_id, error = %e, "Unparseable webhook payload");
                return IngestOutcome::Ignored;
            }
        };

        let store = self.enqueuer.store();
        let Some(repo) = store.find_active_repository(&event.owner, &event.repo) else {
            debug!(
                delivery = delivery_id,
                repo = %format!("{}/{}", event.owner, event.repo),
                "Webhook for unknown or inactive repository"
            );
            return IngestOutcome::Ignored;
        };

        let candidate = match event.kind {
            EventKind::PullRequest {
                number,
                head_sha,
                head_ref,
            } => Candidate {
                repo_id: repo.id,
                trigger: BuildTrigger::Pr,
                ref_name: head_ref,
                sha: head_sha,
                pr_number: Some(number),
            },
            EventKind::Push { branch, after } => {
                if branch != repo.default_branch {
                    debug!(delivery = delivery_id, %branch, "Push to non-default branch");
                    return IngestOutcome::Ignored;
                }
                Candidate {
                    repo_id: repo.id,
                    trigger: BuildTrigger::Merge,
                    ref_name: branch,
                    sha: after,
                    pr_number: None,
                }
            }
        };

        match self.enqueuer.enqueue(candidate, false).await {
            Ok(EnqueueOutcome::Created(build)) => {
                info!(
                    delivery = delivery_id,
                    build_id = %build.id,
                    repo = %repo.full_name(),
                    "Webhook enqueued build"
                );
                IngestOutcome::Processed
            }
            Ok(EnqueueOutcome::Skipped(_)) => IngestOutcome::Processed,
            Err(e) => {
                warn!(delivery = delivery_id, error = %e, "Failed to enqueue from webhook");
                IngestOutcome::Ignored
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::store::{BuildFilter, Store};
    use crate::types::{BuildStatus, NewRepository, RefKey, Sha};
    use crate::webhooks::signature::sign;

    const SECRET: &str = "hook-secret";

    async fn setup() -> (WebhookIngester, Store) {
        let store = Store::in_memory();
        store
            .create_repository(NewRepository::new("acme", "app"))
            .await
            .unwrap();
        let enqueuer = Enqueuer::new(store.clone(), Duration::from_secs(60));
        (
            WebhookIngester::new(enqueuer, Some(SECRET.to_string())),
            store,
        )
    }

    fn push_body(branch: &str, after: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "ref": format!("refs/heads/{}", branch),
            "after": after,
            "repository": { "name": "app", "owner": { "name": "acme", "login": "acme" } }
        }))
        .unwrap()
    }

    async fn deliver(ingester: &WebhookIngester, event: &str, body: &[u8]) -> IngestOutcome {
        let signature = sign(body, SECRET.as_bytes()).unwrap();
        ingester
            .handle(
                body,
                Delivery {
                    event: Some(event),
                    signature: Some(&signature),
                    delivery_id: Some("d-1"),
                },
            )
            .await
    }

    #[tokio::test]
    async fn push_to_default_branch_enqueues_once() {
        let (ingester, store) = setup().await;
        let body = push_body("main", "abc123");

        assert_eq!(deliver(&ingester, "push", &body).await, IngestOutcome::Processed);

        let builds = store.list_builds(BuildFilter::default(), 50);
        assert_eq!(builds.len(), 1);
        let build = &builds[0];
        assert_eq!(build.trigger, BuildTrigger::Merge);
        assert_eq!(build.ref_name, "main");
        assert_eq!(build.commit_sha, Sha::new("abc123"));
        assert_eq!(build.status, BuildStatus::Queued);

        let rs = store
            .get_ref_state(build.repo_id, &RefKey::new("main", None))
            .unwrap();
        assert_eq!(rs.last_sha, Sha::new("abc123"));

        // Redelivery is deduplicated by the in-flight build.
        deliver(&ingester, "push", &body).await;
        assert_eq!(store.list_builds(BuildFilter::default(), 50).len(), 1);
    }

    #[tokio::test]
    async fn push_to_other_branch_is_ignored() {
        let (ingester, store) = setup().await;
        let outcome = deliver(&ingester, "push", &push_body("develop", "abc123")).await;

        assert_eq!(outcome, IngestOutcome::Ignored);
        assert!(store.list_builds(BuildFilter::default(), 50).is_empty());
    }

    #[tokio::test]
    async fn bad_signature_is_ignored() {
        let (ingester, store) = setup().await;
        let body = push_body("main", "abc123");
        let outcome = ingester
            .handle(
                &body,
                Delivery {
                    event: Some("push"),
                    signature: Some("sha256=00"),
                    delivery_id: None,
                },
            )
            .await;

        assert_eq!(outcome, IngestOutcome::Ignored);
        assert!(store.list_builds(BuildFilter::default(), 50).is_empty());
    }

    #[tokio::test]
    async fn missing_secret_ignores_everything() {
        let store = Store::in_memory();
        store
            .create_repository(NewRepository::new("acme", "app"))
            .await
            .unwrap();
        let ingester = WebhookIngester::new(
            Enqueuer::new(store.clone(), Duration::from_secs(60)),
            Some(String::new()),
        );

        assert_eq!(
            deliver(&ingester, "push", &push_body("main", "abc123")).await,
            IngestOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn pull_request_synchronize_enqueues_pr_build() {
        let (ingester, store) = setup().await;
        let body = serde_json::to_vec(&json!({
            "action": "synchronize",
            "pull_request": { "number": 7, "head": { "sha": "f00d", "ref": "feature" } },
            "repository": { "name": "app", "owner": { "login": "acme" } }
        }))
        .unwrap();

        assert_eq!(
            deliver(&ingester, "pull_request", &body).await,
            IngestOutcome::Processed
        );
        let build = &store.list_builds(BuildFilter::default(), 50)[0];
        assert_eq!(build.trigger, BuildTrigger::Pr);
        assert_eq!(build.pr_number.map(|n| n.0), Some(7));
        assert_eq!(build.label(), "pr:7");
    }

    #[tokio::test]
    async fn unknown_repository_is_ignored() {
        let (ingester, _) = setup().await;
        let body = serde_json::to_vec(&json!({
            "ref": "refs/heads/main",
            "after": "abc123",
            "repository": { "name": "other", "owner": { "login": "acme" } }
        }))
        .unwrap();

        assert_eq!(deliver(&ingester, "push", &body).await, IngestOutcome::Ignored);
    }
}
