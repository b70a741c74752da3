//! Infrastructure layer: job stores, rate limiting, workers and maintenance.

pub mod config;
pub mod ingest;
pub mod maintenance;
pub mod rate_limit;
pub mod stats;
pub mod store;
pub mod worker;


pub use config::{ConfigError, ProcessRole, QueueConfig};
pub use ingest::{IngestError, IngestSummary, Ingestor};
pub use maintenance::{Maintenance, MaintenanceConfig, MaintenanceHandle};
pub use rate_limit::{InMemoryRateLimiter, Permit, RateLimitError, RateLimiter};
pub use stats::{StatsReporter, StatsReporterHandle};
pub use store::{EnqueueOutcome, InMemoryJobStore, JobStore, JobStoreError, PostgresJobStore};
pub use worker::{JobHandler, Worker, WorkerConfig, WorkerHandle, handler_fn, shutdown_all};
