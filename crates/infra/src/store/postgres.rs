//! Postgres-backed job store.
//!
//! ## Claim protocol
//!
//! `claim_batch` is a single statement: a `FOR UPDATE SKIP LOCKED` sub-select picks
//! the candidate ids and the outer `UPDATE` re-checks `status = 'pending'` before
//! marking them, so concurrent claimers skip each other's rows instead of blocking
//! and never mark the same row twice.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | PoolTimedOut / PoolClosed / Io / Tls | `Unavailable` |
//! | ColumnDecode / Decode | `Serialization` |
//! | Database / other | `Storage` |
//!
//! ## Dedup
//!
//! Enqueue with a dedup key takes a transaction-scoped advisory lock on the hash
//! and looks for a live job with that hash inside the window. If the lookup fails
//! the job is inserted anyway, outside the failed transaction.
//!
//! ## Read path
//!
//! `snapshot` runs on an optional read pool (replica) so stats never compete with
//! claims for primary connections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{Span, field, instrument, warn};
use uuid::Uuid;

use dmflow_core::{
    Clock, DeadLetterEntry, DeadLetterReason, DedupHash, Job, JobId, JobOutcome, JobStatus, Lease,
    NewJob, QueueSnapshot, Resolution, ResolutionPlan, RetryPolicy, SystemClock, WorkerId,
};

use super::{EnqueueOutcome, JobStore, JobStoreError, cutoff};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_jobs (
    id UUID PRIMARY KEY,
    payload JSONB NOT NULL,
    dedup_hash TEXT,
    status TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    retry_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    failed_at TIMESTAMPTZ,
    worker_id TEXT,
    last_error TEXT,
    processing_time_ms BIGINT
);
CREATE INDEX IF NOT EXISTS queue_jobs_claim_idx
    ON queue_jobs (priority DESC, created_at ASC) WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS queue_jobs_dedup_idx
    ON queue_jobs (dedup_hash, created_at DESC) WHERE dedup_hash IS NOT NULL;
CREATE INDEX IF NOT EXISTS queue_jobs_processing_idx
    ON queue_jobs (started_at) WHERE status = 'processing';
CREATE INDEX IF NOT EXISTS queue_jobs_completed_idx
    ON queue_jobs (completed_at) WHERE status = 'completed';
CREATE TABLE IF NOT EXISTS queue_dead_letters (
    job_id UUID PRIMARY KEY,
    job JSONB NOT NULL,
    final_attempts INTEGER NOT NULL,
    dead_at TIMESTAMPTZ NOT NULL,
    reason TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS queue_dead_letters_dead_at_idx
    ON queue_dead_letters (dead_at DESC);
"#;

const JOB_COLUMNS: &str = "id, payload, dedup_hash, status, priority, attempts, created_at, \
     started_at, retry_at, completed_at, failed_at, worker_id, last_error, processing_time_ms";

/// Finds a live job with the same dedup hash inside the window.
#[async_trait]
trait DuplicateLookup: Send + Sync + 'static {
    async fn find(
        &self,
        conn: &mut PgConnection,
        hash: &DedupHash,
        since: DateTime<Utc>,
    ) -> Result<Option<JobId>, sqlx::Error>;
}

/// Serializes concurrent enqueues of the same hash with `pg_advisory_xact_lock`.
struct AdvisoryLockLookup;

#[async_trait]
impl DuplicateLookup for AdvisoryLockLookup {
    async fn find(
        &self,
        conn: &mut PgConnection,
        hash: &DedupHash,
        since: DateTime<Utc>,
    ) -> Result<Option<JobId>, sqlx::Error> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(hash.as_str())
            .execute(&mut *conn)
            .await?;

        let row = sqlx::query(
            r#"
            SELECT id FROM queue_jobs
            WHERE dedup_hash = $1 AND created_at >= $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(hash.as_str())
        .bind(since)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|r| r.try_get::<Uuid, _>("id").map(JobId::from_uuid))
            .transpose()
    }
}

#[derive(Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    read_pool: Arc<PgPool>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    dedup: Arc<dyn DuplicateLookup>,
}

impl std::fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        let pool = Arc::new(pool);
        Self {
            read_pool: pool.clone(),
            pool,
            policy,
            clock: Arc::new(SystemClock),
            dedup: Arc::new(AdvisoryLockLookup),
        }
    }

    /// Connect to `database_url`, and to `read_url` for stats when given.
    pub async fn connect(
        database_url: &str,
        read_url: Option<&str>,
        max_connections: u32,
        policy: RetryPolicy,
    ) -> Result<Self, JobStoreError> {
        let pool = pool_options(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let mut store = Self::new(pool, policy);
        if let Some(read_url) = read_url {
            let read_pool = pool_options(max_connections.clamp(1, 4))
                .connect(read_url)
                .await
                .map_err(|e| map_sqlx_error("connect_read", e))?;
            store.read_pool = Arc::new(read_pool);
        }
        Ok(store)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[cfg(test)]
    fn with_dedup_lookup(mut self, lookup: Arc<dyn DuplicateLookup>) -> Self {
        self.dedup = lookup;
        self
    }

    /// Plain insert outside the dedup transaction.
    async fn insert_unchecked(&self, job: &Job) -> Result<EnqueueOutcome, JobStoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;
        insert_job(&mut conn, job).await?;
        Ok(EnqueueOutcome::Enqueued(job.id))
    }
}

fn pool_options(max_connections: u32) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(5))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, request), fields(priority = request.priority, dedup = request.dedup.is_some(), duplicate = field::Empty), err)]
    async fn enqueue(&self, request: NewJob) -> Result<EnqueueOutcome, JobStoreError> {
        let now = self.clock.now();
        let dedup = request.dedup.clone();
        let job = Job::new(request, now);

        let Some(key) = dedup else {
            return self.insert_unchecked(&job).await;
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("enqueue", e))?;

        match self.dedup.find(&mut *tx, &key.hash, cutoff(now, key.window)).await {
            Ok(Some(existing)) => {
                tx.commit().await.map_err(|e| map_sqlx_error("enqueue", e))?;
                Span::current().record("duplicate", true);
                Ok(EnqueueOutcome::Duplicate(existing))
            }
            Ok(None) => {
                insert_job(&mut tx, &job).await?;
                tx.commit().await.map_err(|e| map_sqlx_error("enqueue", e))?;
                Ok(EnqueueOutcome::Enqueued(job.id))
            }
            Err(e) => {
                // Dedup lookup failed: insert anyway. A duplicate is cheaper than a lost event.
                warn!(error = %e, dedup_hash = %key.hash, "dedup check failed; enqueueing without it");
                drop(tx);
                self.insert_unchecked(&job).await
            }
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(worker_id = %worker_id, claimed = field::Empty), err)]
    async fn claim_batch(&self, limit: usize, worker_id: &WorkerId) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let rows = sqlx::query(&format!(
            r#"
            WITH candidates AS (
                SELECT id FROM queue_jobs
                WHERE status = 'pending' AND (retry_at IS NULL OR retry_at <= $1)
                ORDER BY priority DESC, created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_jobs AS j
            SET status = 'processing',
                started_at = $1,
                worker_id = $3,
                attempts = j.attempts + 1
            FROM candidates
            WHERE j.id = candidates.id AND j.status = 'pending'
            RETURNING {}
            "#,
            qualified_columns("j")
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(worker_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, lease, outcome), fields(job_id = %lease.job_id, attempts = lease.attempts), err)]
    async fn resolve(&self, lease: &Lease, outcome: JobOutcome) -> Result<Resolution, JobStoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("resolve", e))?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(lease.job_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("resolve", e))?;

        let Some(row) = row else {
            return Ok(Resolution::Stale);
        };
        let mut job = job_from_row(&row)?;
        if !job.is_held_by(lease) {
            return Ok(Resolution::Stale);
        }

        let plan = ResolutionPlan::for_outcome(&self.policy, job.attempts, &outcome, now);
        if matches!(plan, ResolutionPlan::DeadLetter { .. }) {
            if let Some(entry) = job.into_dead_letter(&plan) {
                insert_dead_letter(&mut tx, &entry).await?;
            }
            sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
                .bind(lease.job_id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("resolve", e))?;
        } else {
            job.apply(&plan);
            update_job(&mut tx, &job).await?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("resolve", e))?;
        Ok(plan.resolution())
    }

    #[instrument(skip(self), fields(reaped = field::Empty), err)]
    async fn reap(&self, stale_after: Duration) -> Result<Vec<JobId>, JobStoreError> {
        let stale_before = cutoff(self.clock.now(), stale_after);
        let rows = sqlx::query(
            r#"
            UPDATE queue_jobs
            SET status = 'pending', worker_id = NULL, started_at = NULL
            WHERE status = 'processing' AND started_at < $1
            RETURNING id
            "#,
        )
        .bind(stale_before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reap", e))?;

        let ids = rows
            .iter()
            .map(|r| r.try_get::<Uuid, _>("id").map(JobId::from_uuid))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("reap", e))?;
        Span::current().record("reaped", ids.len());
        Ok(ids)
    }

    #[instrument(skip(self), err)]
    async fn purge_completed(&self, older_than: Duration) -> Result<u64, JobStoreError> {
        let result = sqlx::query("DELETE FROM queue_jobs WHERE status = 'completed' AND completed_at < $1")
            .bind(cutoff(self.clock.now(), older_than))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_completed", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT job, final_attempts, dead_at, reason
            FROM queue_dead_letters
            ORDER BY dead_at DESC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.read_pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get_dead_letter(&self, id: JobId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        let row = sqlx::query(
            "SELECT job, final_attempts, dead_at, reason FROM queue_dead_letters WHERE job_id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_dead_letter", e))?;
        row.map(|r| dead_letter_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn requeue_dead_letter(&self, id: JobId) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;

        let row = sqlx::query(
            r#"
            DELETE FROM queue_dead_letters WHERE job_id = $1
            RETURNING job, final_attempts, dead_at, reason
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?
        .ok_or(JobStoreError::NotFound(id))?;

        let job = dead_letter_from_row(&row)?.into_requeued_job(now);
        insert_job(&mut tx, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("requeue_dead_letter", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete_dead_letter(&self, id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM queue_dead_letters WHERE job_id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_dead_letter", e))?;
        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn snapshot(&self, window: Duration) -> Result<QueueSnapshot, JobStoreError> {
        let now = self.clock.now();
        let since = cutoff(now, window);

        let jobs = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'completed' AND completed_at >= $1) AS completed_in_window,
                CAST(AVG(processing_time_ms) FILTER (WHERE status = 'completed' AND completed_at >= $1) AS FLOAT8)
                    AS avg_processing_time_ms,
                MIN(created_at) FILTER (WHERE status = 'pending' AND (retry_at IS NULL OR retry_at <= $2))
                    AS oldest_pending
            FROM queue_jobs
            "#,
        )
        .bind(since)
        .bind(now)
        .fetch_one(&*self.read_pool)
        .await
        .map_err(|e| map_sqlx_error("snapshot", e))?;

        let dead = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS dead,
                COUNT(*) FILTER (WHERE dead_at >= $1) AS dead_in_window
            FROM queue_dead_letters
            "#,
        )
        .bind(since)
        .fetch_one(&*self.read_pool)
        .await
        .map_err(|e| map_sqlx_error("snapshot", e))?;

        let count = |row: &PgRow, col: &str| -> Result<u64, JobStoreError> {
            let n: i64 = row.try_get(col).map_err(|e| map_sqlx_error("snapshot", e))?;
            Ok(n.max(0) as u64)
        };

        Ok(QueueSnapshot {
            pending: count(&jobs, "pending")?,
            processing: count(&jobs, "processing")?,
            completed: count(&jobs, "completed")?,
            failed: count(&jobs, "failed")?,
            dead: count(&dead, "dead")?,
            completed_in_window: count(&jobs, "completed_in_window")?,
            dead_in_window: count(&dead, "dead_in_window")?,
            avg_processing_time_ms: jobs
                .try_get("avg_processing_time_ms")
                .map_err(|e| map_sqlx_error("snapshot", e))?,
            oldest_pending_created_at: jobs
                .try_get("oldest_pending")
                .map_err(|e| map_sqlx_error("snapshot", e))?,
            window,
        })
    }
}

async fn insert_job(conn: &mut PgConnection, job: &Job) -> Result<(), JobStoreError> {
    sqlx::query(&format!(
        "INSERT INTO queue_jobs ({JOB_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
    ))
    .bind(job.id.as_uuid())
    .bind(&job.payload)
    .bind(job.dedup_hash.as_ref().map(|h| h.as_str()))
    .bind(job.status.as_str())
    .bind(job.priority)
    .bind(to_i32(job.attempts))
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.retry_at)
    .bind(job.completed_at)
    .bind(job.failed_at)
    .bind(job.worker_id.as_ref().map(|w| w.as_str()))
    .bind(job.last_error.as_deref())
    .bind(job.processing_time_ms.map(to_i64))
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

async fn update_job(conn: &mut PgConnection, job: &Job) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE queue_jobs
        SET status = $2,
            started_at = $3,
            retry_at = $4,
            completed_at = $5,
            failed_at = $6,
            worker_id = $7,
            last_error = $8,
            processing_time_ms = $9
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.started_at)
    .bind(job.retry_at)
    .bind(job.completed_at)
    .bind(job.failed_at)
    .bind(job.worker_id.as_ref().map(|w| w.as_str()))
    .bind(job.last_error.as_deref())
    .bind(job.processing_time_ms.map(to_i64))
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("update_job", e))?;
    Ok(())
}

async fn insert_dead_letter(conn: &mut PgConnection, entry: &DeadLetterEntry) -> Result<(), JobStoreError> {
    let job = serde_json::to_value(&entry.job).map_err(|e| JobStoreError::Serialization(e.to_string()))?;
    sqlx::query(
        r#"
        INSERT INTO queue_dead_letters (job_id, job, final_attempts, dead_at, reason)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (job_id) DO UPDATE
        SET job = EXCLUDED.job,
            final_attempts = EXCLUDED.final_attempts,
            dead_at = EXCLUDED.dead_at,
            reason = EXCLUDED.reason
        "#,
    )
    .bind(entry.job.id.as_uuid())
    .bind(job)
    .bind(to_i32(entry.final_attempts))
    .bind(entry.dead_at)
    .bind(entry.reason.as_str())
    .execute(conn)
    .await
    .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;
    Ok(())
}

fn qualified_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_job", e);
    let status: String = row.try_get("status").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;
    let processing_time_ms: Option<i64> = row.try_get("processing_time_ms").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(decode)?),
        payload: row.try_get("payload").map_err(decode)?,
        dedup_hash: row
            .try_get::<Option<String>, _>("dedup_hash")
            .map_err(decode)?
            .map(DedupHash::from_hex),
        status: status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?,
        priority: row.try_get("priority").map_err(decode)?,
        attempts: attempts.max(0) as u32,
        created_at: row.try_get("created_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        retry_at: row.try_get("retry_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        failed_at: row.try_get("failed_at").map_err(decode)?,
        worker_id: row
            .try_get::<Option<String>, _>("worker_id")
            .map_err(decode)?
            .map(WorkerId::from),
        last_error: row.try_get("last_error").map_err(decode)?,
        processing_time_ms: processing_time_ms.map(|ms| ms.max(0) as u64),
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetterEntry, JobStoreError> {
    let decode = |e: sqlx::Error| map_sqlx_error("decode_dead_letter", e);
    let job: serde_json::Value = row.try_get("job").map_err(decode)?;
    let final_attempts: i32 = row.try_get("final_attempts").map_err(decode)?;
    let reason: String = row.try_get("reason").map_err(decode)?;

    Ok(DeadLetterEntry {
        job: serde_json::from_value(job).map_err(|e| JobStoreError::Serialization(e.to_string()))?,
        final_attempts: final_attempts.max(0) as u32,
        dead_at: row.try_get("dead_at").map_err(decode)?,
        reason: reason
            .parse::<DeadLetterReason>()
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?,
    })
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => JobStoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::ColumnDecode { index, source } => JobStoreError::Serialization(format!(
            "failed to decode column {index} in {operation}: {source}"
        )),
        sqlx::Error::Decode(e) => {
            JobStoreError::Serialization(format!("decode error in {operation}: {e}"))
        }
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use dmflow_core::ManualClock;
    use serde_json::json;
    use sqlx::Executor;

    /// Store on a fresh schema of `DATABASE_URL`; `None` when the variable is unset.
    async fn test_store() -> Option<(PostgresJobStore, String)> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let schema = format!("dmflow_test_{}", Uuid::now_v7().simple());

        let admin = PgPool::connect(&url).await.expect("connect to DATABASE_URL");
        admin
            .execute(format!("CREATE SCHEMA {schema}").as_str())
            .await
            .expect("create test schema");
        admin.close().await;

        let search_path = format!("SET search_path TO {schema}");
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .after_connect(move |conn, _meta| {
                let search_path = search_path.clone();
                Box::pin(async move {
                    conn.execute(search_path.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&url)
            .await
            .expect("connect test pool");

        let store = PostgresJobStore::new(pool, RetryPolicy::default());
        store.ensure_schema().await.expect("apply schema");
        Some((store, schema))
    }

    async fn drop_schema(store: &PostgresJobStore, schema: &str) {
        store
            .pool()
            .execute(format!("DROP SCHEMA {schema} CASCADE").as_str())
            .await
            .expect("drop test schema");
    }

    fn keyed(n: i64, hash: &str) -> NewJob {
        NewJob::new(json!({ "n": n })).with_dedup(DedupHash::from_hex(hash), Duration::from_secs(3600))
    }

    struct BrokenLookup;

    #[async_trait]
    impl DuplicateLookup for BrokenLookup {
        async fn find(
            &self,
            _conn: &mut PgConnection,
            _hash: &DedupHash,
            _since: DateTime<Utc>,
        ) -> Result<Option<JobId>, sqlx::Error> {
            Err(sqlx::Error::Protocol("dedup lookup unavailable".to_string()))
        }
    }

    #[test]
    fn pool_errors_are_transient() {
        assert!(map_sqlx_error("claim_batch", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error("claim_batch", sqlx::Error::PoolClosed).is_transient());
        assert!(!map_sqlx_error("claim_batch", sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn qualified_columns_prefix_every_column() {
        let cols = qualified_columns("j");
        assert!(cols.starts_with("j.id, j.payload"));
        assert!(cols.ends_with("j.processing_time_ms"));
        assert_eq!(cols.matches("j.").count(), JOB_COLUMNS.split(", ").count());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimers_never_share_a_job() {
        let Some((store, schema)) = test_store().await else {
            return;
        };
        for n in 0..100 {
            store.enqueue(NewJob::new(json!({ "n": n }))).await.unwrap();
        }

        let mut tasks = Vec::new();
        for w in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let worker = WorkerId::new(format!("w-{w}"));
                let mut ids = Vec::new();
                loop {
                    let batch = store.claim_batch(5, &worker).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    for job in batch {
                        assert_eq!(job.status, JobStatus::Processing);
                        assert_eq!(job.attempts, 1);
                        assert_eq!(job.worker_id.as_ref(), Some(&worker));
                        ids.push(job.id);
                    }
                }
                ids
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for id in task.await.unwrap() {
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(seen.len(), 100);
        drop_schema(&store, &schema).await;
    }

    #[tokio::test]
    async fn dedup_window_suppresses_then_expires() {
        let Some((store, schema)) = test_store().await else {
            return;
        };
        let clock = ManualClock::default();
        let store = store.with_clock(Arc::new(clock.clone()));

        let first = store.enqueue(keyed(1, "abc123")).await.unwrap();
        let EnqueueOutcome::Enqueued(first_id) = first else {
            panic!("expected a new job, got {first:?}");
        };

        clock.advance(chrono::Duration::minutes(59));
        assert_eq!(
            store.enqueue(keyed(2, "abc123")).await.unwrap(),
            EnqueueOutcome::Duplicate(first_id)
        );
        assert!(matches!(
            store.enqueue(keyed(3, "def456")).await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));

        clock.advance(chrono::Duration::minutes(2));
        assert!(matches!(
            store.enqueue(keyed(4, "abc123")).await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));
        assert_eq!(store.snapshot(Duration::from_secs(3600)).await.unwrap().pending, 3);
        drop_schema(&store, &schema).await;
    }

    #[tokio::test]
    async fn failed_dedup_lookup_still_enqueues() {
        let Some((store, schema)) = test_store().await else {
            return;
        };
        let first = store.enqueue(keyed(1, "abc123")).await.unwrap().job_id();

        let broken = store.clone().with_dedup_lookup(Arc::new(BrokenLookup));
        let second = broken.enqueue(keyed(2, "abc123")).await.unwrap();
        let EnqueueOutcome::Enqueued(second_id) = second else {
            panic!("expected the job to be enqueued, got {second:?}");
        };
        assert_ne!(second_id, first);

        let stored = store.get(second_id).await.unwrap().expect("job was inserted");
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.dedup_hash.as_ref().map(|h| h.as_str()), Some("abc123"));
        assert_eq!(store.snapshot(Duration::from_secs(3600)).await.unwrap().pending, 2);
        drop_schema(&store, &schema).await;
    }

    #[tokio::test]
    async fn jobs_in_backoff_do_not_age_the_queue() {
        let Some((store, schema)) = test_store().await else {
            return;
        };
        let clock = ManualClock::default();
        let store = store.with_clock(Arc::new(clock.clone()));
        store.enqueue(NewJob::new(json!({ "n": 1 }))).await.unwrap();
        let lease = store.claim_batch(1, &WorkerId::new("w")).await.unwrap()[0].lease().unwrap();
        let resolution = store.resolve(&lease, JobOutcome::retryable("502")).await.unwrap();
        assert!(matches!(resolution, Resolution::Retrying { .. }));

        let snapshot = store.snapshot(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.oldest_pending_created_at, None);
        drop_schema(&store, &schema).await;
    }
}
