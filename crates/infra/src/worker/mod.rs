//! Claim loop.
//!
//! ## Design
//!
//! - Each worker owns one loop: `idle → claiming → dispatching → idle`
//! - At most `max_concurrent` handler invocations in flight per worker
//! - Every invocation runs in its own task under a timeout; panics and timeouts
//!   become retryable failures and are resolved like any other outcome
//! - Many workers (in one process or many) share a store with no coordination
//!   beyond the store's atomic claim
//! - Shutdown stops claiming, drains in-flight jobs for a grace period, then
//!   aborts the rest (they are recovered by the reaper)

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use dmflow_core::{Job, JobOutcome, Resolution, WorkerId};

use crate::config::QueueConfig;
use crate::rate_limit::{Permit, RateLimiter};
use crate::store::JobStore;

pub mod handler;
pub mod stats;

pub use handler::{FnHandler, JobHandler, handler_fn};
pub use stats::{WorkerPhase, WorkerStats, WorkerStatsSnapshot};

const RESOLVE_ATTEMPTS: u32 = 3;
const RESOLVE_RETRY_BASE: Duration = Duration::from_millis(100);

/// Claim loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub job_timeout: Duration,
    /// Sleep when nothing is claimable.
    pub idle_poll_interval: Duration,
    /// Sleep after a store or limiter error.
    pub error_backoff: Duration,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_queue_config(&QueueConfig::default())
    }
}

impl WorkerConfig {
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_concurrent: config.max_concurrent,
            job_timeout: config.job_timeout,
            idle_poll_interval: config.idle_poll_interval,
            error_backoff: Duration::from_secs(1),
            shutdown_grace: config.shutdown_grace,
        }
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_idle_poll_interval(mut self, interval: Duration) -> Self {
        self.idle_poll_interval = interval;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Handle to control and join a running worker.
///
/// Dropping the handle without calling [`WorkerHandle::shutdown`] also stops the
/// loop (the shutdown channel closes).
#[derive(Debug)]
pub struct WorkerHandle {
    worker_id: WorkerId,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
}

impl WorkerHandle {
    pub fn id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Live counters, readable after the handle itself has been consumed.
    pub fn shared_stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Stop claiming without waiting.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Request graceful shutdown and wait for the worker to drain and stop.
    pub async fn shutdown(mut self) {
        self.signal_shutdown();
        if let Some(join) = self.join.take()
            && let Err(e) = join.await
        {
            error!(worker_id = %self.worker_id, error = %e, "worker task failed");
        }
    }
}

/// Signal every worker first, then wait for all of them, so they drain in parallel.
pub async fn shutdown_all(handles: Vec<WorkerHandle>) {
    for handle in &handles {
        handle.signal_shutdown();
    }
    for handle in handles {
        handle.shutdown().await;
    }
}

/// Builder for one claim loop.
pub struct Worker {
    id: WorkerId,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    limiter: Option<Arc<dyn RateLimiter>>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(store: Arc<dyn JobStore>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            id: WorkerId::generate("worker"),
            store,
            handler,
            limiter: None,
            config,
        }
    }

    pub fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Spawn the loop on the current Tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(WorkerStats::default());
        let worker_id = self.id.clone();

        let ctx = Arc::new(DispatchContext {
            worker_id: self.id.clone(),
            store: self.store.clone(),
            handler: self.handler,
            job_timeout: self.config.job_timeout,
            stats: stats.clone(),
        });
        let claim_loop = ClaimLoop {
            id: self.id,
            store: self.store,
            limiter: self.limiter,
            config: self.config,
            stats: stats.clone(),
            ctx,
        };
        let join = tokio::spawn(claim_loop.run(shutdown_rx));

        WorkerHandle {
            worker_id,
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

struct ClaimLoop {
    id: WorkerId,
    store: Arc<dyn JobStore>,
    limiter: Option<Arc<dyn RateLimiter>>,
    config: WorkerConfig,
    stats: Arc<WorkerStats>,
    ctx: Arc<DispatchContext>,
}

/// How many jobs the limiter allows this round.
enum Budget {
    Granted(usize, Option<Permit>),
    Wait(Duration),
}

impl ClaimLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.id, batch_size = self.config.batch_size, max_concurrent = self.config.max_concurrent, "worker started");
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            if stop_requested(&shutdown) {
                break;
            }
            while let Some(done) = in_flight.try_join_next() {
                log_join_error(&self.id, done);
            }

            let room = self.config.max_concurrent.saturating_sub(in_flight.len());
            if room == 0 {
                tokio::select! {
                    done = in_flight.join_next() => {
                        if let Some(done) = done {
                            log_join_error(&self.id, done);
                        }
                    }
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            let (want, permit) = match self.budget(room.min(self.config.batch_size)).await {
                Budget::Granted(want, permit) => (want, permit),
                Budget::Wait(delay) => {
                    pause(&mut shutdown, delay).await;
                    continue;
                }
            };

            self.stats.set_phase(WorkerPhase::Claiming);
            let claimed = self.store.claim_batch(want, &self.id).await;
            self.refund(permit, want, claimed.as_ref().map_or(0, Vec::len)).await;

            match claimed {
                Ok(jobs) if jobs.is_empty() => {
                    self.stats.set_phase(WorkerPhase::Idle);
                    pause(&mut shutdown, self.config.idle_poll_interval).await;
                }
                Ok(jobs) => {
                    self.stats.set_phase(WorkerPhase::Dispatching);
                    self.stats.record_claimed(jobs.len());
                    debug!(worker_id = %self.id, claimed = jobs.len(), "claimed batch");
                    for job in jobs {
                        let ctx = self.ctx.clone();
                        let guard = InFlightGuard::new(self.stats.clone());
                        in_flight.spawn(async move {
                            let _in_flight = guard;
                            ctx.execute(job).await
                        });
                    }
                    self.stats.set_phase(WorkerPhase::Idle);
                }
                Err(e) => {
                    self.stats.record_store_error();
                    self.stats.set_phase(WorkerPhase::Idle);
                    error!(worker_id = %self.id, error = %e, transient = e.is_transient(), "claim failed; backing off");
                    pause(&mut shutdown, self.config.error_backoff).await;
                }
            }
        }

        self.drain(in_flight).await;
    }

    async fn budget(&self, want: usize) -> Budget {
        let Some(limiter) = &self.limiter else {
            return Budget::Granted(want, None);
        };
        let want_u32 = u32::try_from(want).unwrap_or(u32::MAX);
        match limiter.try_acquire(want_u32).await {
            Ok(permit) if permit.granted == 0 => {
                debug!(worker_id = %self.id, resets_in_ms = permit.resets_in.as_millis() as u64, "rate limited");
                Budget::Wait(permit.resets_in)
            }
            Ok(permit) => Budget::Granted(permit.granted as usize, Some(permit)),
            Err(e) => {
                // Fail closed: no budget while the limiter is unreachable.
                warn!(worker_id = %self.id, error = %e, "rate limiter unavailable; not claiming");
                Budget::Wait(self.config.error_backoff)
            }
        }
    }

    async fn refund(&self, permit: Option<Permit>, requested: usize, claimed: usize) {
        let (Some(permit), Some(limiter)) = (permit, &self.limiter) else {
            return;
        };
        let unused = u32::try_from(requested.saturating_sub(claimed)).unwrap_or(u32::MAX);
        if unused == 0 {
            return;
        }
        if let Err(e) = limiter.refund(&permit, unused).await {
            warn!(worker_id = %self.id, error = %e, unused, "failed to refund rate limit tokens");
        }
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        self.stats.set_phase(WorkerPhase::Draining);
        let pending = in_flight.len();
        if pending > 0 {
            info!(worker_id = %self.id, in_flight = pending, grace_ms = self.config.shutdown_grace.as_millis() as u64, "draining in-flight jobs");
        }

        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while let Some(done) = in_flight.join_next().await {
                log_join_error(&self.id, done);
            }
        })
        .await;

        if drained.is_err() {
            let abandoned = in_flight.len();
            warn!(worker_id = %self.id, abandoned, "grace period elapsed; aborting jobs (they will be reaped)");
            in_flight.shutdown().await;
        }
        self.stats.set_phase(WorkerPhase::Stopped);
        info!(worker_id = %self.id, "worker stopped");
    }
}

/// Shared by every dispatched job of one worker.
struct DispatchContext {
    worker_id: WorkerId,
    store: Arc<dyn JobStore>,
    handler: Arc<dyn JobHandler>,
    job_timeout: Duration,
    stats: Arc<WorkerStats>,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Counts a dispatched job as in flight until dropped, including when the
/// dispatch task is aborted.
struct InFlightGuard(Arc<WorkerStats>);

impl InFlightGuard {
    fn new(stats: Arc<WorkerStats>) -> Self {
        stats.job_started();
        Self(stats)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.job_finished();
    }
}

impl DispatchContext {
    async fn execute(&self, job: Job) {
        let Some(lease) = job.lease() else {
            warn!(job_id = %job.id, status = %job.status, "claimed job has no lease; skipping");
            return;
        };

        let outcome = self.invoke(job).await;
        if let JobOutcome::RetryableFailure { error } | JobOutcome::TerminalFailure { error } = &outcome {
            warn!(job_id = %lease.job_id, worker_id = %self.worker_id, attempts = lease.attempts, error = %error, "job failed");
        }

        for attempt in 0..RESOLVE_ATTEMPTS {
            match self.store.resolve(&lease, outcome.clone()).await {
                Ok(resolution) => {
                    self.stats.record_resolution(&resolution);
                    log_resolution(&lease.job_id, &self.worker_id, lease.attempts, &resolution);
                    return;
                }
                Err(e) if e.is_transient() && attempt + 1 < RESOLVE_ATTEMPTS => {
                    warn!(job_id = %lease.job_id, error = %e, attempt, "resolve failed; retrying");
                    tokio::time::sleep(RESOLVE_RETRY_BASE * 2u32.pow(attempt)).await;
                }
                Err(e) => {
                    self.stats.record_store_error();
                    error!(job_id = %lease.job_id, worker_id = %self.worker_id, error = %e, "failed to record outcome; job stays processing until reaped");
                    return;
                }
            }
        }
    }

    /// Run the handler in its own task so a panic or timeout is contained.
    async fn invoke(&self, job: Job) -> JobOutcome {
        let handler = self.handler.clone();
        let started = Instant::now();
        let task = tokio::spawn(async move { handler.process(&job).await });
        let _abort = AbortOnDrop(task.abort_handle());

        match tokio::time::timeout(self.job_timeout, task).await {
            Ok(Ok(result)) => JobOutcome::from_result(result, started.elapsed()),
            Ok(Err(e)) if e.is_panic() => JobOutcome::retryable("handler panicked"),
            Ok(Err(_)) => JobOutcome::retryable("handler cancelled"),
            Err(_) => {
                self.stats.record_timeout();
                JobOutcome::timeout()
            }
        }
    }
}

fn log_resolution(job_id: &dmflow_core::JobId, worker_id: &WorkerId, attempts: u32, resolution: &Resolution) {
    match resolution {
        Resolution::Completed => debug!(job_id = %job_id, worker_id = %worker_id, attempts, "job completed"),
        Resolution::Retrying { retry_at } => {
            info!(job_id = %job_id, worker_id = %worker_id, attempts, retry_at = %retry_at, "job rescheduled")
        }
        Resolution::DeadLettered => warn!(job_id = %job_id, worker_id = %worker_id, attempts, "job dead-lettered"),
        Resolution::Stale => {
            warn!(job_id = %job_id, worker_id = %worker_id, attempts, "lease no longer held; outcome discarded")
        }
    }
}

fn log_join_error(worker_id: &WorkerId, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result
        && !e.is_cancelled()
    {
        error!(worker_id = %worker_id, error = %e, "dispatch task failed");
    }
}

/// True once shutdown was signalled or the handle was dropped.
fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.changed() => {}
    }
}
