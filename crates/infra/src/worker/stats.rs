//! Per-worker runtime counters.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::Serialize;

use dmflow_core::Resolution;

/// Claim loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Claiming,
    Dispatching,
    Draining,
    Stopped,
}

impl WorkerPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkerPhase::Claiming,
            2 => WorkerPhase::Dispatching,
            3 => WorkerPhase::Draining,
            4 => WorkerPhase::Stopped,
            _ => WorkerPhase::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerPhase::Idle => 0,
            WorkerPhase::Claiming => 1,
            WorkerPhase::Dispatching => 2,
            WorkerPhase::Draining => 3,
            WorkerPhase::Stopped => 4,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerStats {
    claimed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    timeouts: AtomicU64,
    stale: AtomicU64,
    store_errors: AtomicU64,
    in_flight: AtomicU64,
    phase: AtomicU8,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatsSnapshot {
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub timeouts: u64,
    /// Resolves rejected because the lease no longer matched.
    pub stale: u64,
    pub store_errors: u64,
    pub in_flight: u64,
    pub phase: WorkerPhase,
}

impl WorkerStats {
    pub(crate) fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase.as_u8(), Ordering::Relaxed);
    }

    pub(crate) fn record_claimed(&self, n: usize) {
        self.claimed.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn job_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resolution(&self, resolution: &Resolution) {
        let counter = match resolution {
            Resolution::Completed => &self.succeeded,
            Resolution::Retrying { .. } => &self.retried,
            Resolution::DeadLettered => &self.dead_lettered,
            Resolution::Stale => &self.stale,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            phase: WorkerPhase::from_u8(self.phase.load(Ordering::Relaxed)),
        }
    }
}
