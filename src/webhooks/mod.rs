//! Webhook handling for GitHub events.
//!
//! This module provides:
//! - Signature verification for webhook payloads (HMAC-SHA256)
//! - A narrow, all-optional payload schema for `push` and `pull_request`
//! - [`WebhookIngester`], which maps accepted events onto build candidates

pub mod events;
pub mod ingest;
pub mod signature;

use thiserror::Error;

pub use events::{EventKind, WebhookEvent, parse_event};
pub use ingest::{Delivery, IngestOutcome, WebhookIngester};
pub use signature::{format_signature_header, parse_signature_header, sign, verify_signature};

/// Error type for webhook payload failures.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The body was not JSON, or a present field had the wrong type.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
