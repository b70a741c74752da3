//! Request/response DTOs for the HTTP surface.

use serde::{Deserialize, Serialize};

use dmflow_core::{HealthReport, JobId, WorkerId};
use dmflow_infra::{IngestSummary, worker::WorkerStatsSnapshot};

pub const DEFAULT_DEAD_LETTER_LIMIT: usize = 100;
pub const MAX_DEAD_LETTER_LIMIT: usize = 1000;

/// Subscription handshake parameters (`hub.*`).
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct WebhookAck {
    pub accepted: usize,
    pub duplicates: usize,
}

impl From<IngestSummary> for WebhookAck {
    fn from(summary: IngestSummary) -> Self {
        Self {
            accepted: summary.accepted,
            duplicates: summary.duplicates,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub limit: Option<usize>,
}

impl DeadLetterQuery {
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
            .clamp(1, MAX_DEAD_LETTER_LIMIT)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapResponse {
    pub reaped: usize,
    pub job_ids: Vec<JobId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatsView {
    pub worker_id: WorkerId,
    #[serde(flatten)]
    pub stats: WorkerStatsSnapshot,
}

/// Queue health plus per-worker counters of this process.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub report: HealthReport,
    pub workers: Vec<WorkerStatsView>,
}
