//! Narrow webhook payload schema.
//!
//! Only the fields that can produce a build candidate are deserialized, and
//! every one of them is optional. A payload missing a required field parses to
//! `Ok(None)`: the event is ignorable, not malformed. Only bytes that are not
//! JSON at all produce an error.

use serde::Deserialize;

use super::WebhookError;
use crate::types::{PrNumber, Sha};

/// Pull request actions that can change the head commit.
const BUILDABLE_PR_ACTIONS: [&str; 3] = ["opened", "reopened", "synchronize"];

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// A webhook event that names a commit worth considering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub owner: String,
    pub repo: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A PR was opened, reopened, or received new commits.
    PullRequest {
        number: PrNumber,
        head_sha: Sha,
        head_ref: String,
    },
    /// A branch was pushed. `branch` has the `refs/heads/` prefix removed.
    Push { branch: String, after: Sha },
}

/// Parses a delivery into an event, or `None` if it cannot yield a candidate.
pub fn parse_event(event_type: &str, payload: &[u8]) -> Result<Option<WebhookEvent>, WebhookError> {
    match event_type {
        "pull_request" => {
            let raw: RawPullRequestPayload = serde_json::from_slice(payload)?;
            Ok(pull_request_event(raw))
        }
        "push" => {
            let raw: RawPushPayload = serde_json::from_slice(payload)?;
            Ok(push_event(raw))
        }
        _ => Ok(None),
    }
}

// ─── Raw payloads ───

#[derive(Debug, Default, Deserialize)]
struct RawRepository {
    owner: Option<RawOwner>,
    name: Option<String>,
}

/// Push payloads carry `owner.name`; most others carry `owner.login`.
#[derive(Debug, Default, Deserialize)]
struct RawOwner {
    login: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPullRequestPayload {
    action: Option<String>,
    pull_request: Option<RawPullRequest>,
    repository: Option<RawRepository>,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    number: Option<u64>,
    head: Option<RawHead>,
}

#[derive(Debug, Deserialize)]
struct RawHead {
    sha: Option<String>,
    #[serde(rename = "ref")]
    ref_field: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPushPayload {
    #[serde(rename = "ref")]
    ref_field: Option<String>,
    after: Option<String>,
    repository: Option<RawRepository>,
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

fn repository_identity(repo: Option<RawRepository>) -> Option<(String, String)> {
    let repo = repo?;
    let owner = repo.owner.unwrap_or_default();
    let owner = non_empty(owner.login).or(non_empty(owner.name))?;
    let name = non_empty(repo.name)?;
    Some((owner, name))
}

fn pull_request_event(raw: RawPullRequestPayload) -> Option<WebhookEvent> {
    let action = raw.action?;
    if !BUILDABLE_PR_ACTIONS.contains(&action.as_str()) {
        return None;
    }

    let (owner, repo) = repository_identity(raw.repository)?;
    let pr = raw.pull_request?;
    let head = pr.head?;

    Some(WebhookEvent {
        owner,
        repo,
        kind: EventKind::PullRequest {
            number: PrNumber(pr.number.filter(|n| *n > 0)?),
            head_sha: Sha::new(non_empty(head.sha)?),
            head_ref: non_empty(head.ref_field)?,
        },
    })
}

fn push_event(raw: RawPushPayload) -> Option<WebhookEvent> {
    let (owner, repo) = repository_identity(raw.repository)?;
    let full_ref = non_empty(raw.ref_field)?;
    let after = non_empty(raw.after)?;
    // A deleted branch reports the null SHA; there is nothing to build.
    if after.bytes().all(|b| b == b'0') {
        return None;
    }
    let branch = full_ref
        .strip_prefix(BRANCH_REF_PREFIX)
        .unwrap_or(&full_ref)
        .to_string();

    Some(WebhookEvent {
        owner,
        repo,
        kind: EventKind::Push {
            branch,
            after: Sha::new(after),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bytes(value: serde_json::Value) -> Vec<u8> {
        serde_json::to_vec(&value).unwrap()
    }

    fn pr_payload(action: &str) -> serde_json::Value {
        json!({
            "action": action,
            "number": 42,
            "pull_request": {
                "number": 42,
                "head": { "sha": "deadbeef", "ref": "feature/x" },
                "base": { "ref": "main" }
            },
            "repository": { "name": "app", "owner": { "login": "acme" } }
        })
    }

    #[test]
    fn parses_buildable_pull_request_actions() {
        for action in BUILDABLE_PR_ACTIONS {
            let event = parse_event("pull_request", &bytes(pr_payload(action)))
                .unwrap()
                .unwrap();
            assert_eq!(event.owner, "acme");
            assert_eq!(
                event.kind,
                EventKind::PullRequest {
                    number: PrNumber(42),
                    head_sha: Sha::new("deadbeef"),
                    head_ref: "feature/x".to_string(),
                }
            );
        }
    }

    #[test]
    fn ignores_other_pull_request_actions() {
        for action in ["closed", "labeled", "edited"] {
            assert!(
                parse_event("pull_request", &bytes(pr_payload(action)))
                    .unwrap()
                    .is_none()
            );
        }
    }

    #[test]
    fn missing_head_sha_is_ignorable() {
        let mut payload = pr_payload("opened");
        payload["pull_request"]["head"]
            .as_object_mut()
            .unwrap()
            .remove("sha");
        assert!(parse_event("pull_request", &bytes(payload)).unwrap().is_none());
    }

    #[test]
    fn push_strips_branch_prefix_and_falls_back_to_owner_name() {
        let payload = json!({
            "ref": "refs/heads/main",
            "after": "abc123",
            "repository": { "name": "app", "owner": { "name": "acme" } }
        });
        let event = parse_event("push", &bytes(payload)).unwrap().unwrap();

        assert_eq!(event.owner, "acme");
        assert_eq!(event.repo, "app");
        assert_eq!(
            event.kind,
            EventKind::Push {
                branch: "main".to_string(),
                after: Sha::new("abc123"),
            }
        );
    }

    #[test]
    fn branch_deletion_push_is_ignorable() {
        let payload = json!({
            "ref": "refs/heads/main",
            "after": "0000000000000000000000000000000000000000",
            "deleted": true,
            "repository": { "name": "app", "owner": { "login": "acme" } }
        });
        assert!(parse_event("push", &bytes(payload)).unwrap().is_none());
    }

    #[test]
    fn push_without_repository_is_ignorable() {
        let payload = json!({ "ref": "refs/heads/main", "after": "abc123" });
        assert!(parse_event("push", &bytes(payload)).unwrap().is_none());
    }

    #[test]
    fn unknown_events_are_ignored_without_parsing() {
        assert!(parse_event("issues", b"not json").unwrap().is_none());
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(parse_event("push", b"{").is_err());
    }
}
