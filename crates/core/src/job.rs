//! Core job types and state transitions.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dedup::DedupHash;
use crate::error::DomainError;
use crate::id::{JobId, WorkerId};
use crate::outcome::ResolutionPlan;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued; claimable once `retry_at` has passed
    Pending,
    /// Held by exactly one worker
    Processing,
    /// Handler succeeded
    Completed,
    /// Transient marker between a failed attempt and its retry/dead-letter decision
    Failed,
    /// Exhausted retries or failed terminally; lives in the dead-letter store
    Dead,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Dead)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// Duplicate-suppression key attached to an enqueue request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupKey {
    pub hash: DedupHash,
    /// Trailing window during which an earlier job with the same hash suppresses this one.
    pub window: Duration,
}

/// An enqueue request.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub payload: serde_json::Value,
    pub priority: i32,
    pub dedup: Option<DedupKey>,
}

impl NewJob {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            priority: 0,
            dedup: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dedup(mut self, hash: DedupHash, window: Duration) -> Self {
        self.dedup = Some(DedupKey { hash, window });
        self
    }
}

/// A queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Passed to the handler verbatim
    pub payload: serde_json::Value,
    pub dedup_hash: Option<DedupHash>,
    pub status: JobStatus,
    /// Higher is claimed first
    pub priority: i32,
    /// Incremented exactly once per claim
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<WorkerId>,
    pub last_error: Option<String>,
    pub processing_time_ms: Option<u64>,
}

impl Job {
    /// Create a pending job from an enqueue request.
    pub fn new(request: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            payload: request.payload,
            dedup_hash: request.dedup.map(|d| d.hash),
            status: JobStatus::Pending,
            priority: request.priority,
            attempts: 0,
            created_at: now,
            started_at: None,
            retry_at: None,
            completed_at: None,
            failed_at: None,
            worker_id: None,
            last_error: None,
            processing_time_ms: None,
        }
    }

    /// `status = pending` and `retry_at` is unset or has passed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.retry_at.is_none_or(|at| at <= now)
    }

    /// Ownership token for the current claim.
    pub fn lease(&self) -> Option<Lease> {
        match (&self.status, &self.worker_id) {
            (JobStatus::Processing, Some(worker_id)) => Some(Lease {
                job_id: self.id,
                attempts: self.attempts,
                worker_id: worker_id.clone(),
            }),
            _ => None,
        }
    }

    /// Transition `pending → processing` for `worker_id`.
    pub fn mark_claimed(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.is_claimable(now) {
            return Err(DomainError::invalid_transition(format!(
                "job {} is not claimable (status={})",
                self.id, self.status
            )));
        }
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.worker_id = Some(worker_id.clone());
        self.attempts += 1;
        Ok(())
    }

    /// Whether `lease` still describes this job's current claim.
    pub fn is_held_by(&self, lease: &Lease) -> bool {
        self.id == lease.job_id
            && self.status == JobStatus::Processing
            && self.attempts == lease.attempts
            && self.worker_id.as_ref() == Some(&lease.worker_id)
    }

    /// Apply a completion or reschedule. Dead-lettering is handled by
    /// [`Job::into_dead_letter`] because the job leaves the primary store.
    pub fn apply(&mut self, plan: &ResolutionPlan) {
        match plan {
            ResolutionPlan::Complete {
                completed_at,
                processing_time_ms,
            } => {
                self.status = JobStatus::Completed;
                self.completed_at = Some(*completed_at);
                self.processing_time_ms = Some(*processing_time_ms);
                self.retry_at = None;
            }
            ResolutionPlan::Reschedule {
                retry_at,
                failed_at,
                error,
            } => {
                self.status = JobStatus::Pending;
                self.retry_at = Some(*retry_at);
                self.failed_at = Some(*failed_at);
                self.last_error = Some(error.clone());
                self.worker_id = None;
                self.started_at = None;
            }
            ResolutionPlan::DeadLetter {
                dead_at, error, ..
            } => {
                self.status = JobStatus::Dead;
                self.failed_at = Some(*dead_at);
                self.last_error = Some(error.clone());
                self.worker_id = None;
            }
        }
    }

    /// Return an orphaned `processing` job to `pending` without touching `attempts`.
    pub fn release_stale(&mut self) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.started_at = None;
    }

    /// Copy this job into a dead-letter entry.
    pub fn into_dead_letter(mut self, plan: &ResolutionPlan) -> Option<DeadLetterEntry> {
        let ResolutionPlan::DeadLetter {
            dead_at, reason, ..
        } = plan
        else {
            return None;
        };
        self.apply(plan);
        Some(DeadLetterEntry {
            final_attempts: self.attempts,
            dead_at: *dead_at,
            reason: reason.clone(),
            job: self,
        })
    }
}

/// Proof of a claim: the job id, the attempt number it was claimed at and the
/// claiming worker.
///
/// Resolving with a lease that no longer matches the stored job (the job was
/// reaped and claimed again, or already resolved) is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub attempts: u32,
    pub worker_id: WorkerId,
}

/// Why a job was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Handler reported a failure that can never succeed
    TerminalFailure,
    /// Retryable failures exhausted `max_retries`
    RetriesExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::TerminalFailure => "terminal_failure",
            DeadLetterReason::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl FromStr for DeadLetterReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "terminal_failure" => Ok(DeadLetterReason::TerminalFailure),
            "retries_exhausted" => Ok(DeadLetterReason::RetriesExhausted),
            other => Err(DomainError::validation(format!("unknown dead-letter reason: {other}"))),
        }
    }
}

/// Entry in the dead-letter store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Copy of the job in `dead` status
    pub job: Job,
    pub final_attempts: u32,
    pub dead_at: DateTime<Utc>,
    pub reason: DeadLetterReason,
}

impl DeadLetterEntry {
    /// Job to re-insert on manual requeue: `pending`, attempts reset, errors cleared.
    /// `created_at` moves to `now` so the job queues behind current work.
    pub fn into_requeued_job(self, now: DateTime<Utc>) -> Job {
        let mut job = self.job;
        job.status = JobStatus::Pending;
        job.created_at = now;
        job.attempts = 0;
        job.retry_at = None;
        job.started_at = None;
        job.completed_at = None;
        job.failed_at = None;
        job.worker_id = None;
        job.last_error = None;
        job.processing_time_ms = None;
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn new_job(now: DateTime<Utc>) -> Job {
        Job::new(NewJob::new(serde_json::json!({"k": "v"})).with_priority(3), now)
    }

    #[test]
    fn new_job_is_pending_and_claimable() {
        let now = Utc::now();
        let job = new_job(now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.priority, 3);
        assert!(job.is_claimable(now));
    }

    #[test]
    fn retry_at_gates_claimability() {
        let now = Utc::now();
        let mut job = new_job(now);
        job.retry_at = Some(now + ChronoDuration::seconds(10));
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + ChronoDuration::seconds(10)));
    }

    #[test]
    fn claim_increments_attempts_once() {
        let now = Utc::now();
        let worker = WorkerId::new("w-1");
        let mut job = new_job(now);

        job.mark_claimed(&worker, now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.worker_id, Some(worker.clone()));

        // Second claim is rejected and leaves attempts alone.
        assert!(job.mark_claimed(&worker, now).is_err());
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn lease_tracks_the_current_claim() {
        let now = Utc::now();
        let worker = WorkerId::new("w-1");
        let mut job = new_job(now);
        assert!(job.lease().is_none());

        job.mark_claimed(&worker, now).unwrap();
        let lease = job.lease().unwrap();
        assert!(job.is_held_by(&lease));

        job.release_stale();
        assert!(!job.is_held_by(&lease));
        assert_eq!(job.attempts, 1);

        job.mark_claimed(&worker, now).unwrap();
        assert!(!job.is_held_by(&lease));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("archived".parse::<JobStatus>().is_err());
    }

    #[test]
    fn requeue_resets_attempts_and_errors() {
        let now = Utc::now();
        let mut job = new_job(now);
        job.mark_claimed(&WorkerId::new("w"), now).unwrap();
        let plan = ResolutionPlan::DeadLetter {
            dead_at: now,
            error: "boom".into(),
            reason: DeadLetterReason::TerminalFailure,
        };
        let entry = job.into_dead_letter(&plan).unwrap();
        assert_eq!(entry.job.status, JobStatus::Dead);
        assert_eq!(entry.final_attempts, 1);

        let requeued = entry.into_requeued_job(now);
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert!(requeued.last_error.is_none());
        assert!(requeued.is_claimable(now));
    }
}
