//! Job handlers shipped with the binary.
//!
//! Business logic (automation rules, replies) lives outside this service; the
//! forwarding handler hands each job to it over HTTP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use dmflow_core::{HandlerError, Job};
use dmflow_events::WebhookEvent;
use dmflow_infra::JobHandler;

pub const JOB_ID_HEADER: &str = "x-dmflow-job-id";
pub const ATTEMPT_HEADER: &str = "x-dmflow-attempt";

/// POSTs the job payload to `HANDLER_URL`.
#[derive(Debug, Clone)]
pub struct HttpForwardHandler {
    client: reqwest::Client,
    url: String,
}

impl HttpForwardHandler {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl JobHandler for HttpForwardHandler {
    async fn process(&self, job: &Job) -> Result<(), HandlerError> {
        let response = self
            .client
            .post(&self.url)
            .header(JOB_ID_HEADER, job.id.to_string())
            .header(ATTEMPT_HEADER, job.attempts.to_string())
            .json(&job.payload)
            .send()
            .await
            .map_err(|e| HandlerError::retryable(format!("handler request failed: {e}")))?;

        classify_status(response.status())
    }
}

/// 2xx done; 408/429 and 5xx retry; any other status is permanent.
pub fn classify_status(status: StatusCode) -> Result<(), HandlerError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("handler responded {status}");
    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
        Err(HandlerError::retryable(message))
    } else {
        Err(HandlerError::terminal(message))
    }
}

/// Logs each event and completes it. Used when no `HANDLER_URL` is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl JobHandler for LoggingHandler {
    async fn process(&self, job: &Job) -> Result<(), HandlerError> {
        let event = WebhookEvent::from_payload(&job.payload)
            .map_err(|e| HandlerError::terminal(format!("unrecognized payload: {e}")))?;
        tracing::info!(
            job_id = %job.id,
            kind = event.kind().as_str(),
            account_id = event.account_id(),
            sender_id = event.sender_id(),
            "event received"
        );
        Ok(())
    }
}

/// Forwarding handler when `HANDLER_URL` is set, logging handler otherwise.
pub fn from_env(job_timeout: Duration) -> anyhow::Result<Arc<dyn JobHandler>> {
    match std::env::var("HANDLER_URL").ok().filter(|u| !u.trim().is_empty()) {
        Some(url) => {
            tracing::info!(url = %url, "forwarding jobs over HTTP");
            Ok(Arc::new(HttpForwardHandler::new(url, job_timeout)?))
        }
        None => {
            tracing::warn!("HANDLER_URL not set; jobs are only logged");
            Ok(Arc::new(LoggingHandler))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::OK).is_ok());
        assert!(classify_status(StatusCode::NO_CONTENT).is_ok());
        assert!(matches!(classify_status(StatusCode::BAD_GATEWAY), Err(HandlerError::Retryable(_))));
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS), Err(HandlerError::Retryable(_))));
        assert!(matches!(classify_status(StatusCode::UNPROCESSABLE_ENTITY), Err(HandlerError::Terminal(_))));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND), Err(HandlerError::Terminal(_))));
    }

    #[tokio::test]
    async fn logging_handler_rejects_foreign_payloads() {
        let job = Job::new(dmflow_core::NewJob::new(json!({"kind": "unknown"})), chrono::Utc::now());
        assert!(matches!(LoggingHandler.process(&job).await, Err(HandlerError::Terminal(_))));
    }

    #[tokio::test]
    async fn unreachable_handler_is_retryable() {
        let handler = HttpForwardHandler::new("http://127.0.0.1:9/jobs", Duration::from_millis(500)).unwrap();
        let job = Job::new(dmflow_core::NewJob::new(json!({})), chrono::Utc::now());
        assert!(matches!(handler.process(&job).await, Err(HandlerError::Retryable(_))));
    }
}
