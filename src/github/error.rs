//! GitHub API error types.
//!
//! Every failed upstream call is a hard failure for that call. The kind only
//! tells the log reader whether waiting is likely to help:
//!
//! - **Transient**: 5xx, rate limits, network failures
//! - **Permanent**: other 4xx, missing credentials

use std::fmt;
use thiserror::Error;

/// The kind of GitHub API error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitHubErrorKind {
    /// Likely to succeed on a later pass.
    Transient,

    /// Needs operator attention (bad token, missing repository, ...).
    Permanent,
}

impl fmt::Display for GitHubErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GitHubErrorKind::Transient => f.write_str("transient"),
            GitHubErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// A categorized GitHub API error.
#[derive(Debug, Error)]
pub struct GitHubApiError {
    pub kind: GitHubErrorKind,

    /// The HTTP status code, if available.
    pub status_code: Option<u16>,

    pub message: String,

    #[source]
    pub source: Option<octocrab::Error>,
}

impl fmt::Display for GitHubApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "GitHub API error (HTTP {}): {}", code, self.message),
            None => write!(f, "GitHub API error: {}", self.message),
        }
    }
}

impl GitHubApiError {
    /// The client was built without a bearer token.
    pub fn missing_credentials() -> Self {
        Self::permanent_without_source("missing credentials")
    }

    pub fn permanent_without_source(message: impl Into<String>) -> Self {
        Self {
            kind: GitHubErrorKind::Permanent,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn transient_without_source(message: impl Into<String>) -> Self {
        Self {
            kind: GitHubErrorKind::Transient,
            status_code: None,
            message: message.into(),
            source: None,
        }
    }

    /// Categorizes an octocrab error by status code, falling back to the
    /// message text when no response was received.
    pub fn from_octocrab(err: octocrab::Error) -> Self {
        let status_code = extract_status_code(&err);
        let message = err.to_string();
        let kind = classify(status_code, &message);

        Self {
            kind,
            status_code,
            message,
            source: Some(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code == Some(404)
    }
}

fn extract_status_code(err: &octocrab::Error) -> Option<u16> {
    match err {
        octocrab::Error::GitHub { source, .. } => Some(source.status_code.as_u16()),
        _ => None,
    }
}

fn classify(status_code: Option<u16>, message: &str) -> GitHubErrorKind {
    match status_code {
        Some(429) => GitHubErrorKind::Transient,
        Some(403) if is_rate_limit_error(message) => GitHubErrorKind::Transient,
        Some(code) if (500..600).contains(&code) => GitHubErrorKind::Transient,
        Some(_) => GitHubErrorKind::Permanent,
        None if is_network_error(message) => GitHubErrorKind::Transient,
        None => GitHubErrorKind::Permanent,
    }
}

fn is_rate_limit_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("rate limit")
        || message_lower.contains("secondary rate")
        || message_lower.contains("abuse detection")
}

fn is_network_error(message: &str) -> bool {
    let message_lower = message.to_lowercase();
    message_lower.contains("timeout")
        || message_lower.contains("timed out")
        || message_lower.contains("connection")
        || message_lower.contains("dns")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_classify() {
        assert_eq!(classify(Some(429), ""), GitHubErrorKind::Transient);
        assert_eq!(classify(Some(502), ""), GitHubErrorKind::Transient);
        assert_eq!(
            classify(Some(403), "API rate limit exceeded"),
            GitHubErrorKind::Transient
        );
        assert_eq!(
            classify(Some(403), "Resource not accessible"),
            GitHubErrorKind::Permanent
        );
        assert_eq!(classify(Some(404), ""), GitHubErrorKind::Permanent);
    }

    #[test]
    fn network_failures_are_transient() {
        assert_eq!(
            classify(None, "error trying to connect: connection refused"),
            GitHubErrorKind::Transient
        );
        assert_eq!(classify(None, "request timed out"), GitHubErrorKind::Transient);
        assert_eq!(classify(None, "invalid header"), GitHubErrorKind::Permanent);
    }

    #[test]
    fn missing_credentials_is_permanent() {
        let err = GitHubApiError::missing_credentials();
        assert_eq!(err.kind, GitHubErrorKind::Permanent);
        assert_eq!(err.to_string(), "GitHub API error: missing credentials");
    }
}
