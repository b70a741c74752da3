//! Provider webhook endpoints.
//!
//! The POST path only verifies, parses and enqueues; processing happens in the
//! workers. Answering quickly matters: the provider retries slow or failed
//! deliveries, and those retries are absorbed by dedup.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Extension, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};

use dmflow_events::{ParseError, SIGNATURE_HEADER, parse_instagram_webhook, verify_signature};

use crate::app::dto::{VerifyQuery, WebhookAck};
use crate::app::{errors, services::AppServices};

pub fn router() -> Router {
    Router::new().route("/instagram", get(verify).post(receive))
}

/// GET /webhooks/instagram - subscription handshake
pub async fn verify(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<VerifyQuery>,
) -> axum::response::Response {
    let Some(expected) = services.settings.verify_token.as_deref() else {
        return errors::json_error(StatusCode::FORBIDDEN, "verification_disabled", "no verify token configured");
    };

    let token_matches = query.verify_token.as_deref() == Some(expected);
    match (query.mode.as_deref(), token_matches, query.challenge) {
        (Some("subscribe"), true, Some(challenge)) => {
            tracing::info!("webhook subscription verified");
            (StatusCode::OK, challenge).into_response()
        }
        _ => errors::json_error(StatusCode::FORBIDDEN, "verification_failed", "invalid verification request"),
    }
}

/// POST /webhooks/instagram - verify, parse and enqueue a delivery
pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    if let Some(secret) = services.settings.app_secret.as_deref() {
        let header = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if let Err(e) = verify_signature(&body, header, secret.as_bytes()) {
            tracing::warn!(error = %e, "rejected webhook delivery");
            return errors::json_error(StatusCode::UNAUTHORIZED, "invalid_signature", e.to_string());
        }
    }

    let events = match parse_instagram_webhook(&body) {
        Ok(events) => events,
        Err(ParseError::UnsupportedObject(object)) => {
            // Acknowledge so the provider stops redelivering.
            tracing::warn!(object = %object, "ignoring webhook for unsupported object");
            return Json(WebhookAck::default()).into_response();
        }
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_payload", e.to_string()),
    };

    match services.ingestor().ingest_all(&events).await {
        Ok(summary) => {
            tracing::debug!(accepted = summary.accepted, duplicates = summary.duplicates, "webhook delivery ingested");
            Json(WebhookAck::from(summary)).into_response()
        }
        Err(e) => errors::ingest_error_to_response(e),
    }
}
