//! Periodic store maintenance: stale-claim reaping and completed-job retention.
//!
//! Runs independently of the claim loops; any number of processes may run it
//! concurrently (`reap` and `purge_completed` are single conditional updates).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use dmflow_core::JobId;

use crate::config::QueueConfig;
use crate::store::{JobStore, JobStoreError};

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub stale_after: Duration,
    pub reap_interval: Duration,
    pub completed_retention: Duration,
}

impl MaintenanceConfig {
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            stale_after: config.stale_processing_threshold,
            reap_interval: config.reap_interval,
            completed_retention: config.completed_retention,
        }
    }
}

/// Reaper + retention purge over one store.
#[derive(Clone)]
pub struct Maintenance {
    store: Arc<dyn JobStore>,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(store: Arc<dyn JobStore>, config: MaintenanceConfig) -> Self {
        Self { store, config }
    }

    pub fn stale_after(&self) -> Duration {
        self.config.stale_after
    }

    /// Return stale `processing` jobs to `pending`. Also used by the manual reap trigger.
    pub async fn reap_now(&self) -> Result<Vec<JobId>, JobStoreError> {
        let reaped = self.store.reap(self.config.stale_after).await?;
        if !reaped.is_empty() {
            warn!(count = reaped.len(), stale_after_secs = self.config.stale_after.as_secs(), "reaped stale jobs");
        }
        Ok(reaped)
    }

    pub async fn purge_now(&self) -> Result<u64, JobStoreError> {
        let purged = self.store.purge_completed(self.config.completed_retention).await?;
        if purged > 0 {
            info!(purged, "purged completed jobs past retention");
        }
        Ok(purged)
    }

    /// One maintenance pass; errors are logged, never propagated.
    pub async fn tick(&self) {
        if let Err(e) = self.reap_now().await {
            error!(error = %e, "reap failed");
        }
        if let Err(e) = self.purge_now().await {
            error!(error = %e, "retention purge failed");
        }
    }

    pub fn spawn(self) -> MaintenanceHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => self.tick().await,
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("maintenance stopped");
        });
        MaintenanceHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        }
    }
}

#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}
