//! Health/stats reporter.
//!
//! Reads go through [`JobStore::snapshot`]. The Postgres store serves it from the
//! read pool (a replica when configured), so reports do not take primary
//! connections away from claims. The in-memory store scans under its read lock,
//! which blocks claims for the length of the scan.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use dmflow_core::{Clock, HealthReport, HealthStatus, HealthThresholds, SystemClock};

use crate::config::QueueConfig;
use crate::store::{JobStore, JobStoreError};

pub struct StatsReporter {
    store: Arc<dyn JobStore>,
    thresholds: HealthThresholds,
    window: Duration,
    clock: Arc<dyn Clock>,
    latest: RwLock<Option<HealthReport>>,
}

impl StatsReporter {
    pub fn new(store: Arc<dyn JobStore>, thresholds: HealthThresholds, window: Duration) -> Self {
        Self {
            store,
            thresholds,
            window,
            clock: Arc::new(SystemClock),
            latest: RwLock::new(None),
        }
    }

    pub fn from_queue_config(store: Arc<dyn JobStore>, config: &QueueConfig) -> Self {
        Self::new(store, config.health.clone(), config.stats_window)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Compute a fresh report.
    pub async fn report(&self) -> Result<HealthReport, JobStoreError> {
        let snapshot = self.store.snapshot(self.window).await?;
        let report = HealthReport::from_snapshot(&snapshot, &self.thresholds, self.clock.now());
        if let Ok(mut latest) = self.latest.write() {
            *latest = Some(report.clone());
        }
        Ok(report)
    }

    /// Last report computed by [`StatsReporter::report`] or the timer task.
    pub fn latest(&self) -> Option<HealthReport> {
        self.latest.read().ok().and_then(|l| l.clone())
    }

    /// Refresh the report every `interval`, logging health transitions.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> StatsReporterHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut previous = HealthStatus::Healthy;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.report().await {
                            Ok(report) => {
                                log_transition(previous, &report);
                                previous = report.health_status;
                            }
                            Err(e) => error!(error = %e, "failed to compute queue stats"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        StatsReporterHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

fn log_transition(previous: HealthStatus, report: &HealthReport) {
    let issues = report.issues.join("; ");
    match (previous, report.health_status) {
        (p, c) if p == c => {}
        (_, HealthStatus::Critical) => {
            error!(pending = report.pending, success_rate_pct = report.success_rate_pct, issues = %issues, "queue health critical")
        }
        (_, HealthStatus::Warning) => {
            warn!(pending = report.pending, success_rate_pct = report.success_rate_pct, issues = %issues, "queue health degraded")
        }
        (_, HealthStatus::Healthy) => info!(pending = report.pending, "queue health recovered"),
    }
}

#[derive(Debug)]
pub struct StatsReporterHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl StatsReporterHandle {
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmflow_core::{JobOutcome, NewJob, RetryPolicy, WorkerId};
    use serde_json::json;

    use crate::store::InMemoryJobStore;

    #[tokio::test]
    async fn report_reflects_store_and_is_cached() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        for n in 0..4 {
            store.enqueue(NewJob::new(json!({ "n": n }))).await.unwrap();
        }
        let claimed = store.claim_batch(2, &WorkerId::new("w")).await.unwrap();
        store
            .resolve(&claimed[0].lease().unwrap(), JobOutcome::success(Duration::from_millis(40)))
            .await
            .unwrap();

        let reporter = StatsReporter::new(store, HealthThresholds::default(), Duration::from_secs(3600));
        assert!(reporter.latest().is_none());

        let report = reporter.report().await.unwrap();
        assert_eq!(report.pending, 2);
        assert_eq!(report.processing, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.completed_last_window, 1);
        assert_eq!(report.avg_processing_time_ms, Some(40.0));
        assert_eq!(report.health_status, HealthStatus::Healthy);
        assert_eq!(reporter.latest(), Some(report));
    }

    #[tokio::test]
    async fn thresholds_are_configurable() {
        let store = InMemoryJobStore::arc(RetryPolicy::default());
        for n in 0..3 {
            store.enqueue(NewJob::new(json!({ "n": n }))).await.unwrap();
        }
        let thresholds = HealthThresholds {
            pending_warning: 1,
            pending_critical: 2,
            ..Default::default()
        };
        let reporter = StatsReporter::new(store, thresholds, Duration::from_secs(60));
        assert_eq!(reporter.report().await.unwrap().health_status, HealthStatus::Critical);
    }
}
