//! Handler outcomes and how they resolve a claimed job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::DeadLetterReason;
use crate::retry::RetryPolicy;

/// Error returned by a job handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth retrying (network error, downstream 5xx, timeout).
    #[error("retryable: {0}")]
    Retryable(String),
    /// Can never succeed (malformed payload, downstream 4xx).
    #[error("terminal: {0}")]
    Terminal(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }
}

/// Result of one handler invocation, as reported to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success { processing_time: Duration },
    RetryableFailure { error: String },
    TerminalFailure { error: String },
}

impl JobOutcome {
    pub fn success(processing_time: Duration) -> Self {
        Self::Success { processing_time }
    }

    pub fn retryable(error: impl Into<String>) -> Self {
        Self::RetryableFailure {
            error: error.into(),
        }
    }

    pub fn terminal(error: impl Into<String>) -> Self {
        Self::TerminalFailure {
            error: error.into(),
        }
    }

    /// Outcome for a handler that ran past its per-job timeout.
    pub fn timeout() -> Self {
        Self::retryable("timeout")
    }

    /// Classify a handler result.
    pub fn from_result(result: Result<(), HandlerError>, elapsed: Duration) -> Self {
        match result {
            Ok(()) => Self::success(elapsed),
            Err(HandlerError::Retryable(e)) => Self::RetryableFailure { error: e },
            Err(HandlerError::Terminal(e)) => Self::TerminalFailure { error: e },
        }
    }
}

/// Concrete state change a store applies for an outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPlan {
    Complete {
        completed_at: DateTime<Utc>,
        processing_time_ms: u64,
    },
    Reschedule {
        retry_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: String,
    },
    DeadLetter {
        dead_at: DateTime<Utc>,
        error: String,
        reason: DeadLetterReason,
    },
}

impl ResolutionPlan {
    /// Decide what happens to a job claimed `attempts` times that produced `outcome`.
    pub fn for_outcome(
        policy: &RetryPolicy,
        attempts: u32,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_delay(policy, attempts, outcome, now, policy.jittered_backoff(attempts))
    }

    /// Same as [`ResolutionPlan::for_outcome`] with an explicit retry delay.
    pub fn with_delay(
        policy: &RetryPolicy,
        attempts: u32,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Self {
        match outcome {
            JobOutcome::Success { processing_time } => ResolutionPlan::Complete {
                completed_at: now,
                processing_time_ms: u64::try_from(processing_time.as_millis()).unwrap_or(u64::MAX),
            },
            JobOutcome::RetryableFailure { error } if policy.should_retry(attempts) => {
                let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
                ResolutionPlan::Reschedule {
                    retry_at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
                    failed_at: now,
                    error: error.clone(),
                }
            }
            JobOutcome::RetryableFailure { error } => ResolutionPlan::DeadLetter {
                dead_at: now,
                error: error.clone(),
                reason: DeadLetterReason::RetriesExhausted,
            },
            JobOutcome::TerminalFailure { error } => ResolutionPlan::DeadLetter {
                dead_at: now,
                error: error.clone(),
                reason: DeadLetterReason::TerminalFailure,
            },
        }
    }

    pub fn resolution(&self) -> Resolution {
        match self {
            ResolutionPlan::Complete { .. } => Resolution::Completed,
            ResolutionPlan::Reschedule { retry_at, .. } => Resolution::Retrying {
                retry_at: *retry_at,
            },
            ResolutionPlan::DeadLetter { .. } => Resolution::DeadLettered,
        }
    }
}

/// What `resolve` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum Resolution {
    Completed,
    Retrying { retry_at: DateTime<Utc> },
    DeadLettered,
    /// The lease no longer matched (already resolved, or reaped and re-claimed). Nothing changed.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::exponential(3, Duration::from_secs(5), Duration::from_secs(600))
    }

    #[test]
    fn success_completes_with_processing_time() {
        let now = Utc::now();
        let plan = ResolutionPlan::for_outcome(
            &policy(),
            1,
            &JobOutcome::success(Duration::from_millis(250)),
            now,
        );
        assert_eq!(
            plan,
            ResolutionPlan::Complete {
                completed_at: now,
                processing_time_ms: 250
            }
        );
    }

    #[test]
    fn retryable_failure_reschedules_below_max() {
        let now = Utc::now();
        let plan = ResolutionPlan::with_delay(
            &policy(),
            2,
            &JobOutcome::retryable("503"),
            now,
            Duration::from_secs(20),
        );
        match plan {
            ResolutionPlan::Reschedule { retry_at, error, .. } => {
                assert_eq!(retry_at, now + chrono::Duration::seconds(20));
                assert_eq!(error, "503");
            }
            other => panic!("expected reschedule, got {other:?}"),
        }
    }

    #[test]
    fn retryable_failure_dead_letters_at_max() {
        let plan =
            ResolutionPlan::for_outcome(&policy(), 3, &JobOutcome::timeout(), Utc::now());
        assert!(matches!(
            plan,
            ResolutionPlan::DeadLetter {
                reason: DeadLetterReason::RetriesExhausted,
                ref error,
                ..
            } if error == "timeout"
        ));
    }

    #[test]
    fn terminal_failure_dead_letters_immediately() {
        let plan =
            ResolutionPlan::for_outcome(&policy(), 1, &JobOutcome::terminal("bad payload"), Utc::now());
        assert_eq!(plan.resolution(), Resolution::DeadLettered);
    }

    #[test]
    fn handler_errors_classify() {
        let elapsed = Duration::from_millis(5);
        assert_eq!(
            JobOutcome::from_result(Err(HandlerError::terminal("400")), elapsed),
            JobOutcome::terminal("400")
        );
        assert_eq!(
            JobOutcome::from_result(Err(HandlerError::retryable("502")), elapsed),
            JobOutcome::retryable("502")
        );
        assert_eq!(JobOutcome::from_result(Ok(()), elapsed), JobOutcome::success(elapsed));
    }
}
