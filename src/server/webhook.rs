//! `POST /webhooks/github`.
//!
//! Always answers 200 so the sender never retries; whether the delivery was
//! acted on is visible only through the `ignored` flag and the logs.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::Serialize;

use super::AppState;
use crate::github::SourceControl;
use crate::webhooks::{Delivery, IngestOutcome};

const HEADER_EVENT: &str = "x-github-event";
const HEADER_DELIVERY: &str = "x-github-delivery";
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

#[derive(Debug, Serialize)]
pub struct WebhookReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ignored: bool,
}

pub async fn webhook_handler<S: SourceControl>(
    State(app): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<WebhookReply> {
    let delivery = Delivery {
        event: header(&headers, HEADER_EVENT),
        signature: header(&headers, HEADER_SIGNATURE),
        delivery_id: header(&headers, HEADER_DELIVERY),
    };

    let outcome = app.ingester().handle(&body, delivery).await;
    Json(WebhookReply {
        ok: true,
        ignored: outcome == IngestOutcome::Ignored,
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
