//! Job Store: durable persistence for queued jobs plus the dead-letter store.
//!
//! ## Design
//!
//! - All job mutation goes through `enqueue`, `claim_batch`, `resolve` and `reap`
//!   (plus the operational dead-letter/purge calls)
//! - `claim_batch` selects and marks in one atomic step; two workers never claim
//!   the same job
//! - `resolve` is fenced by the [`Lease`] returned from the claim, which makes it
//!   idempotent and rejects workers whose job was reaped
//! - Dedup is checked inside `enqueue` and fails open
//!
//! ## Backends
//!
//! - [`InMemoryJobStore`]: dev/tests
//! - [`PostgresJobStore`]: `FOR UPDATE SKIP LOCKED` claim over `queue_jobs`

use std::time::Duration;

use async_trait::async_trait;

use dmflow_core::{
    DeadLetterEntry, Job, JobId, JobOutcome, Lease, NewJob, QueueSnapshot, Resolution, WorkerId,
};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(JobId),
    /// A job with the same dedup hash exists inside the window; nothing was inserted.
    Duplicate(JobId),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueOutcome::Duplicate(_))
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("not found: {0}")]
    NotFound(JobId),
    /// Store could not be reached (connection refused, pool exhausted, timeout).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl JobStoreError {
    /// Errors the claim loop should back off from and retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_))
    }
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a `pending` job, or return the existing id when the dedup hash was
    /// seen within its window.
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, JobStoreError>;

    /// Get a job from the primary store (dead-lettered jobs are not returned).
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically claim up to `limit` claimable jobs, ordered by
    /// `priority desc, created_at asc`.
    async fn claim_batch(&self, limit: usize, worker_id: &WorkerId) -> Result<Vec<Job>, JobStoreError>;

    /// Record the outcome of a claimed job.
    async fn resolve(&self, lease: &Lease, outcome: JobOutcome) -> Result<Resolution, JobStoreError>;

    /// Return `processing` jobs started before `now - stale_after` to `pending`.
    async fn reap(&self, stale_after: Duration) -> Result<Vec<JobId>, JobStoreError>;

    /// Delete `completed` jobs whose `completed_at` is older than `older_than`.
    async fn purge_completed(&self, older_than: Duration) -> Result<u64, JobStoreError>;

    /// Most recent dead letters first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    async fn get_dead_letter(&self, id: JobId) -> Result<Option<DeadLetterEntry>, JobStoreError>;

    /// Move a dead letter back to `pending` with `attempts` reset.
    async fn requeue_dead_letter(&self, id: JobId) -> Result<Job, JobStoreError>;

    async fn delete_dead_letter(&self, id: JobId) -> Result<(), JobStoreError>;

    /// Counts and window aggregates for the health reporter.
    async fn snapshot(&self, window: Duration) -> Result<QueueSnapshot, JobStoreError>;
}

/// `now - ago`, saturating at the earliest representable time.
pub(crate) fn cutoff(
    now: chrono::DateTime<chrono::Utc>,
    ago: Duration,
) -> chrono::DateTime<chrono::Utc> {
    chrono::Duration::from_std(ago)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}
