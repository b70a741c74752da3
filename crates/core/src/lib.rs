//! `dmflow-core` — queue domain building blocks.
//!
//! This crate contains **pure domain** logic (no infrastructure concerns): job
//! state transitions, retry planning, dedup hashing and health classification.

pub mod clock;
pub mod dedup;
pub mod error;
pub mod health;
pub mod id;
pub mod job;
pub mod outcome;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dedup::{DedupHash, Deduplicable};
pub use error::{DomainError, DomainResult};
pub use health::{HealthReport, HealthStatus, HealthThresholds, QueueSnapshot};
pub use id::{JobId, WorkerId};
pub use job::{DeadLetterEntry, DeadLetterReason, DedupKey, Job, JobStatus, Lease, NewJob};
pub use outcome::{HandlerError, JobOutcome, Resolution, ResolutionPlan};
pub use retry::RetryPolicy;
