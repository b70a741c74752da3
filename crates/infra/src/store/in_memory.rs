//! In-memory job store for tests/dev.
//!
//! Every mutation runs under one write lock, so `claim_batch` selects and marks
//! in a single critical section.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dmflow_core::{
    Clock, DeadLetterEntry, DedupHash, Job, JobId, JobOutcome, JobStatus, Lease, NewJob,
    QueueSnapshot, Resolution, ResolutionPlan, RetryPolicy, SystemClock, WorkerId,
};

use super::{EnqueueOutcome, JobStore, JobStoreError, cutoff};

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    /// Latest job enqueued per dedup hash.
    by_hash: HashMap<DedupHash, JobId>,
    dead_letters: HashMap<JobId, DeadLetterEntry>,
}

impl State {
    fn duplicate_of(&self, hash: &DedupHash, since: DateTime<Utc>) -> Option<JobId> {
        let id = self.by_hash.get(hash)?;
        let job = self.jobs.get(id)?;
        (job.created_at >= since).then_some(job.id)
    }

    fn forget_hash(&mut self, job: &Job) {
        if let Some(hash) = &job.dedup_hash
            && self.by_hash.get(hash) == Some(&job.id)
        {
            self.by_hash.remove(hash);
        }
    }
}

pub struct InMemoryJobStore {
    state: RwLock<State>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl InMemoryJobStore {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: RwLock::new(State::default()),
            policy,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn arc(policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self::new(policy))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Overwrite `started_at` of a `processing` job. Lets tests age a claim past the
    /// stale threshold without waiting.
    pub fn set_started_at(&self, id: JobId, started_at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let mut state = self.write()?;
        let job = state.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.started_at = Some(started_at);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, JobStoreError> {
        self.state
            .read()
            .map_err(|_| JobStoreError::Storage("in-memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, JobStoreError> {
        self.state
            .write()
            .map_err(|_| JobStoreError::Storage("in-memory store lock poisoned".to_string()))
    }
}

impl std::fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, request: NewJob) -> Result<EnqueueOutcome, JobStoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;

        if let Some(key) = &request.dedup
            && let Some(existing) = state.duplicate_of(&key.hash, cutoff(now, key.window))
        {
            return Ok(EnqueueOutcome::Duplicate(existing));
        }

        let job = Job::new(request, now);
        let id = job.id;
        if let Some(hash) = &job.dedup_hash {
            state.by_hash.insert(hash.clone(), id);
        }
        state.jobs.insert(id, job);
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    async fn claim_batch(&self, limit: usize, worker_id: &WorkerId) -> Result<Vec<Job>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let mut state = self.write()?;

        let mut candidates: Vec<(i32, DateTime<Utc>, JobId)> = state
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .map(|j| (j.priority, j.created_at, j.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(job) = state.jobs.get_mut(&id)
                && job.mark_claimed(worker_id, now).is_ok()
            {
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn resolve(&self, lease: &Lease, outcome: JobOutcome) -> Result<Resolution, JobStoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;

        let Some(job) = state.jobs.get_mut(&lease.job_id) else {
            return Ok(Resolution::Stale);
        };
        if !job.is_held_by(lease) {
            return Ok(Resolution::Stale);
        }

        let plan = ResolutionPlan::for_outcome(&self.policy, job.attempts, &outcome, now);
        if matches!(plan, ResolutionPlan::DeadLetter { .. }) {
            let Some(job) = state.jobs.remove(&lease.job_id) else {
                return Ok(Resolution::Stale);
            };
            state.forget_hash(&job);
            if let Some(entry) = job.into_dead_letter(&plan) {
                state.dead_letters.insert(entry.job.id, entry);
            }
        } else {
            job.apply(&plan);
        }
        Ok(plan.resolution())
    }

    async fn reap(&self, stale_after: Duration) -> Result<Vec<JobId>, JobStoreError> {
        let stale_before = cutoff(self.clock.now(), stale_after);
        let mut state = self.write()?;

        let mut reaped = Vec::new();
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Processing && job.started_at.is_some_and(|s| s < stale_before) {
                job.release_stale();
                reaped.push(job.id);
            }
        }
        Ok(reaped)
    }

    async fn purge_completed(&self, older_than: Duration) -> Result<u64, JobStoreError> {
        let before = cutoff(self.clock.now(), older_than);
        let mut state = self.write()?;

        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Completed && j.completed_at.is_some_and(|c| c < before))
            .map(|j| j.id)
            .collect();
        for id in &expired {
            if let Some(job) = state.jobs.remove(id) {
                state.forget_hash(&job);
            }
        }
        Ok(expired.len() as u64)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        let state = self.read()?;
        let mut entries: Vec<_> = state.dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| b.dead_at.cmp(&a.dead_at));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn get_dead_letter(&self, id: JobId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        Ok(self.read()?.dead_letters.get(&id).cloned())
    }

    async fn requeue_dead_letter(&self, id: JobId) -> Result<Job, JobStoreError> {
        let now = self.clock.now();
        let mut state = self.write()?;

        let entry = state.dead_letters.remove(&id).ok_or(JobStoreError::NotFound(id))?;
        let job = entry.into_requeued_job(now);
        if let Some(hash) = &job.dedup_hash {
            state.by_hash.insert(hash.clone(), job.id);
        }
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn delete_dead_letter(&self, id: JobId) -> Result<(), JobStoreError> {
        self.write()?
            .dead_letters
            .remove(&id)
            .map(|_| ())
            .ok_or(JobStoreError::NotFound(id))
    }

    async fn snapshot(&self, window: Duration) -> Result<QueueSnapshot, JobStoreError> {
        let now = self.clock.now();
        let since = cutoff(now, window);
        // Full scan under the read lock; claims wait for it.
        let state = self.read()?;

        let mut snapshot = QueueSnapshot {
            window,
            ..Default::default()
        };
        let mut processing_ms_total: u64 = 0;

        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => {
                    snapshot.pending += 1;
                    if !job.is_claimable(now) {
                        continue;
                    }
                    snapshot.oldest_pending_created_at = Some(
                        snapshot
                            .oldest_pending_created_at
                            .map_or(job.created_at, |oldest| oldest.min(job.created_at)),
                    );
                }
                JobStatus::Processing => snapshot.processing += 1,
                JobStatus::Completed => {
                    snapshot.completed += 1;
                    if job.completed_at.is_some_and(|c| c >= since) {
                        snapshot.completed_in_window += 1;
                        processing_ms_total += job.processing_time_ms.unwrap_or(0);
                    }
                }
                JobStatus::Failed => snapshot.failed += 1,
                JobStatus::Dead => snapshot.dead += 1,
            }
        }

        snapshot.dead += state.dead_letters.len() as u64;
        snapshot.dead_in_window = state
            .dead_letters
            .values()
            .filter(|e| e.dead_at >= since)
            .count() as u64;
        if snapshot.completed_in_window > 0 {
            snapshot.avg_processing_time_ms =
                Some(processing_ms_total as f64 / snapshot.completed_in_window as f64);
        }
        Ok(snapshot)
    }
}
