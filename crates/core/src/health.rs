//! Queue health classification.
//!
//! Stores produce a [`QueueSnapshot`] (raw counts over a window); this module turns
//! it into a [`HealthReport`] using configurable [`HealthThresholds`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Degradation thresholds. Configuration, not business logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub pending_warning: u64,
    pub pending_critical: u64,
    /// Percent, 0-100.
    pub success_rate_warning: f64,
    pub success_rate_critical: f64,
    pub oldest_pending_warning: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            pending_warning: 1000,
            pending_critical: 5000,
            success_rate_warning: 95.0,
            success_rate_critical: 80.0,
            oldest_pending_warning: Duration::from_secs(600),
        }
    }
}

/// Raw aggregate read from a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    /// Jobs completed within `window`.
    pub completed_in_window: u64,
    /// Jobs dead-lettered within `window`.
    pub dead_in_window: u64,
    pub avg_processing_time_ms: Option<f64>,
    pub oldest_pending_created_at: Option<DateTime<Utc>>,
    pub window: Duration,
}

impl QueueSnapshot {
    /// `completed / (completed + dead)` over the window, in percent. 100 with no data.
    pub fn success_rate_pct(&self) -> f64 {
        let total = self.completed_in_window + self.dead_in_window;
        if total == 0 {
            return 100.0;
        }
        self.completed_in_window as f64 * 100.0 / total as f64
    }

    pub fn oldest_pending_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.oldest_pending_created_at
            .map(|created| (now - created).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Stats surface returned by the operational endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub completed_last_window: u64,
    pub window_secs: u64,
    pub avg_processing_time_ms: Option<f64>,
    pub success_rate_pct: f64,
    pub oldest_pending_age_sec: Option<u64>,
    pub health_status: HealthStatus,
    /// Human-readable reasons for a non-healthy status.
    pub issues: Vec<String>,
    pub generated_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn from_snapshot(
        snapshot: &QueueSnapshot,
        thresholds: &HealthThresholds,
        now: DateTime<Utc>,
    ) -> Self {
        let success_rate_pct = snapshot.success_rate_pct();
        let oldest_age = snapshot.oldest_pending_age(now);
        let mut issues = Vec::new();
        let mut status = HealthStatus::Healthy;

        let mut raise = |level: HealthStatus, issue: String| {
            status = status.max(level);
            issues.push(issue);
        };

        if snapshot.pending > thresholds.pending_critical {
            raise(
                HealthStatus::Critical,
                format!("pending backlog {} exceeds {}", snapshot.pending, thresholds.pending_critical),
            );
        } else if snapshot.pending > thresholds.pending_warning {
            raise(
                HealthStatus::Warning,
                format!("pending backlog {} exceeds {}", snapshot.pending, thresholds.pending_warning),
            );
        }

        if success_rate_pct < thresholds.success_rate_critical {
            raise(
                HealthStatus::Critical,
                format!("success rate {success_rate_pct:.1}% below {}%", thresholds.success_rate_critical),
            );
        } else if success_rate_pct < thresholds.success_rate_warning {
            raise(
                HealthStatus::Warning,
                format!("success rate {success_rate_pct:.1}% below {}%", thresholds.success_rate_warning),
            );
        }

        if let Some(age) = oldest_age
            && age > thresholds.oldest_pending_warning
        {
            raise(
                HealthStatus::Warning,
                format!("oldest pending job waiting {}s", age.as_secs()),
            );
        }

        Self {
            pending: snapshot.pending,
            processing: snapshot.processing,
            completed: snapshot.completed,
            failed: snapshot.failed,
            dead: snapshot.dead,
            completed_last_window: snapshot.completed_in_window,
            window_secs: snapshot.window.as_secs(),
            avg_processing_time_ms: snapshot.avg_processing_time_ms,
            success_rate_pct,
            oldest_pending_age_sec: oldest_age.map(|a| a.as_secs()),
            health_status: status,
            issues,
            generated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> QueueSnapshot {
        QueueSnapshot {
            window: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[test]
    fn empty_queue_is_healthy() {
        let report = HealthReport::from_snapshot(&snapshot(), &HealthThresholds::default(), Utc::now());
        assert_eq!(report.health_status, HealthStatus::Healthy);
        assert_eq!(report.success_rate_pct, 100.0);
        assert!(report.issues.is_empty());
        assert!(report.oldest_pending_age_sec.is_none());
    }

    #[test]
    fn pending_backlog_thresholds() {
        let thresholds = HealthThresholds::default();
        let mut s = snapshot();
        s.pending = 1500;
        assert_eq!(
            HealthReport::from_snapshot(&s, &thresholds, Utc::now()).health_status,
            HealthStatus::Warning
        );
        s.pending = 6000;
        assert_eq!(
            HealthReport::from_snapshot(&s, &thresholds, Utc::now()).health_status,
            HealthStatus::Critical
        );
    }

    #[test]
    fn success_rate_counts_completed_against_dead() {
        let mut s = snapshot();
        s.completed_in_window = 90;
        s.dead_in_window = 10;
        let report = HealthReport::from_snapshot(&s, &HealthThresholds::default(), Utc::now());
        assert!((report.success_rate_pct - 90.0).abs() < f64::EPSILON);
        assert_eq!(report.health_status, HealthStatus::Warning);
        assert_eq!(report.issues.len(), 1);
    }

    #[test]
    fn worst_issue_wins() {
        let now = Utc::now();
        let mut s = snapshot();
        s.pending = 1200;
        s.completed_in_window = 1;
        s.dead_in_window = 9;
        s.oldest_pending_created_at = Some(now - chrono::Duration::minutes(30));
        let report = HealthReport::from_snapshot(&s, &HealthThresholds::default(), now);
        assert_eq!(report.health_status, HealthStatus::Critical);
        assert_eq!(report.issues.len(), 3);
        assert_eq!(report.oldest_pending_age_sec, Some(1800));
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = HealthReport::from_snapshot(&snapshot(), &HealthThresholds::default(), Utc::now());
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("completedLastWindow").is_some());
        assert!(json.get("successRatePct").is_some());
        assert_eq!(json["healthStatus"], "healthy");
    }
}
