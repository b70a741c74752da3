//! Ingestion: typed webhook events → deduplicated jobs.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use dmflow_core::{Deduplicable, JobId, NewJob};
use dmflow_events::WebhookEvent;

use crate::config::QueueConfig;
use crate::store::{EnqueueOutcome, JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("enqueue timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

/// Per-delivery enqueue summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub duplicates: usize,
    pub job_ids: Vec<JobId>,
}

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn JobStore>,
    dedup_window: Duration,
    enqueue_timeout: Duration,
}

impl Ingestor {
    pub fn new(store: Arc<dyn JobStore>, dedup_window: Duration, enqueue_timeout: Duration) -> Self {
        Self {
            store,
            dedup_window,
            enqueue_timeout,
        }
    }

    pub fn from_queue_config(store: Arc<dyn JobStore>, config: &QueueConfig) -> Self {
        Self::new(store, config.dedup_window, config.enqueue_timeout)
    }

    /// Build the enqueue request for an event: typed payload, default priority,
    /// semantic dedup hash.
    pub fn job_for(&self, event: &WebhookEvent) -> Result<NewJob, IngestError> {
        let payload = event.to_payload().map_err(|e| IngestError::Encode(e.to_string()))?;
        Ok(NewJob::new(payload)
            .with_priority(event.default_priority())
            .with_dedup(event.dedup_hash(), self.dedup_window))
    }

    /// Enqueue one event, giving up after the enqueue timeout.
    pub async fn ingest(&self, event: &WebhookEvent) -> Result<EnqueueOutcome, IngestError> {
        let job = self.job_for(event)?;
        let outcome = tokio::time::timeout(self.enqueue_timeout, self.store.enqueue(job))
            .await
            .map_err(|_| IngestError::Timeout(self.enqueue_timeout))??;

        match outcome {
            EnqueueOutcome::Enqueued(id) => {
                debug!(job_id = %id, kind = event.kind().as_str(), sender_id = event.sender_id(), "event enqueued")
            }
            EnqueueOutcome::Duplicate(id) => {
                debug!(job_id = %id, kind = event.kind().as_str(), "duplicate event suppressed")
            }
        }
        Ok(outcome)
    }

    /// Enqueue every event of one delivery. Stops at the first store failure so
    /// the caller can ask the provider to redeliver; events enqueued before the
    /// failure are deduplicated on redelivery.
    pub async fn ingest_all(&self, events: &[WebhookEvent]) -> Result<IngestSummary, IngestError> {
        let mut summary = IngestSummary::default();
        for event in events {
            match self.ingest(event).await {
                Ok(EnqueueOutcome::Enqueued(id)) => {
                    summary.accepted += 1;
                    summary.job_ids.push(id);
                }
                Ok(EnqueueOutcome::Duplicate(_)) => summary.duplicates += 1,
                Err(e) => {
                    warn!(error = %e, accepted = summary.accepted, remaining = events.len() - summary.accepted - summary.duplicates, "ingestion failed");
                    return Err(e);
                }
            }
        }
        Ok(summary)
    }
}
