//! Queue configuration loaded from `DMFLOW_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use dmflow_core::{HealthThresholds, RetryPolicy};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Inconsistent(String),
}

/// Which parts of the system a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Webhook ingestion and workers.
    All,
    /// Webhook ingestion and operational endpoints only.
    Ingest,
    /// Claim loops and maintenance only; no webhook endpoint.
    Worker,
}

impl ProcessRole {
    pub fn runs_workers(&self) -> bool {
        matches!(self, ProcessRole::All | ProcessRole::Worker)
    }

    pub fn serves_webhooks(&self) -> bool {
        matches!(self, ProcessRole::All | ProcessRole::Ingest)
    }
}

impl FromStr for ProcessRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(ProcessRole::All),
            "ingest" => Ok(ProcessRole::Ingest),
            "worker" => Ok(ProcessRole::Worker),
            other => Err(format!("expected all, ingest or worker, got {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// 0 disables claim rate limiting.
    pub rate_limit_per_minute: u32,
    pub stale_processing_threshold: Duration,
    pub reap_interval: Duration,
    pub dedup_window: Duration,
    pub job_timeout: Duration,
    pub idle_poll_interval: Duration,
    pub shutdown_grace: Duration,
    pub enqueue_timeout: Duration,
    pub completed_retention: Duration,
    pub stats_window: Duration,
    pub stats_interval: Duration,
    pub health: HealthThresholds,
    pub workers: usize,
    pub role: ProcessRole,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 50,
            batch_size: 10,
            retry: RetryPolicy::default(),
            rate_limit_per_minute: 0,
            stale_processing_threshold: Duration::from_secs(300),
            reap_interval: Duration::from_secs(30),
            dedup_window: Duration::from_secs(3600),
            job_timeout: Duration::from_millis(30_000),
            idle_poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(30),
            enqueue_timeout: Duration::from_millis(2000),
            completed_retention: Duration::from_secs(168 * 3600),
            stats_window: Duration::from_secs(3600),
            stats_interval: Duration::from_secs(60),
            health: HealthThresholds::default(),
            workers: 1,
            role: ProcessRole::All,
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);
        let d = Self::default();

        let retry = RetryPolicy::exponential(
            env.parse("DMFLOW_MAX_RETRIES", d.retry.max_retries)?,
            env.millis("DMFLOW_BACKOFF_BASE_MS", d.retry.base_delay)?,
            env.millis("DMFLOW_BACKOFF_CAP_MS", d.retry.max_delay)?,
        )
        .with_jitter(env.parse("DMFLOW_BACKOFF_JITTER", d.retry.jitter)?);

        let health = HealthThresholds {
            pending_warning: env.parse("DMFLOW_PENDING_WARNING", d.health.pending_warning)?,
            pending_critical: env.parse("DMFLOW_PENDING_CRITICAL", d.health.pending_critical)?,
            success_rate_warning: env.parse("DMFLOW_SUCCESS_RATE_WARNING", d.health.success_rate_warning)?,
            success_rate_critical: env.parse("DMFLOW_SUCCESS_RATE_CRITICAL", d.health.success_rate_critical)?,
            oldest_pending_warning: env.secs("DMFLOW_OLDEST_PENDING_WARNING_SECS", d.health.oldest_pending_warning)?,
        };

        let config = Self {
            max_concurrent: env.parse("DMFLOW_MAX_CONCURRENT", d.max_concurrent)?,
            batch_size: env.parse("DMFLOW_BATCH_SIZE", d.batch_size)?,
            retry,
            rate_limit_per_minute: env.parse("DMFLOW_RATE_LIMIT_PER_MINUTE", d.rate_limit_per_minute)?,
            stale_processing_threshold: env.secs("DMFLOW_STALE_PROCESSING_SECS", d.stale_processing_threshold)?,
            reap_interval: env.secs("DMFLOW_REAP_INTERVAL_SECS", d.reap_interval)?,
            dedup_window: env.secs("DMFLOW_DEDUP_WINDOW_SECS", d.dedup_window)?,
            job_timeout: env.millis("DMFLOW_JOB_TIMEOUT_MS", d.job_timeout)?,
            idle_poll_interval: env.millis("DMFLOW_IDLE_POLL_MS", d.idle_poll_interval)?,
            shutdown_grace: env.secs("DMFLOW_SHUTDOWN_GRACE_SECS", d.shutdown_grace)?,
            enqueue_timeout: env.millis("DMFLOW_ENQUEUE_TIMEOUT_MS", d.enqueue_timeout)?,
            completed_retention: env.hours("DMFLOW_COMPLETED_RETENTION_HOURS", d.completed_retention)?,
            stats_window: env.secs("DMFLOW_STATS_WINDOW_SECS", d.stats_window)?,
            stats_interval: env.secs("DMFLOW_STATS_INTERVAL_SECS", d.stats_interval)?,
            health,
            workers: env.parse("DMFLOW_WORKERS", d.workers)?,
            role: env.parse("DMFLOW_ROLE", d.role)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Inconsistent(msg.to_string()));
        if self.max_concurrent == 0 {
            return fail("max_concurrent must be at least 1");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be at least 1");
        }
        if self.retry.max_retries == 0 {
            return fail("max_retries must be at least 1");
        }
        if self.retry.base_delay > self.retry.max_delay {
            return fail("backoff base must not exceed backoff cap");
        }
        if self.job_timeout.is_zero() {
            return fail("job timeout must be positive");
        }
        if self.stale_processing_threshold <= self.job_timeout {
            return fail("stale processing threshold must exceed the per-job timeout");
        }
        if self.reap_interval.is_zero() || self.stats_interval.is_zero() {
            return fail("reap and stats intervals must be positive");
        }
        if self.health.pending_warning > self.health.pending_critical {
            return fail("pending warning threshold must not exceed the critical threshold");
        }
        if self.health.success_rate_critical > self.health.success_rate_warning {
            return fail("success-rate critical threshold must not exceed the warning threshold");
        }
        if self.workers == 0 {
            return fail("at least one worker is required");
        }
        Ok(())
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) if raw.trim().is_empty() => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let ms: u64 = self.parse(key, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))?;
        Ok(Duration::from_millis(ms))
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.parse(key, default.as_secs())?))
    }

    fn hours(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let hours: u64 = self.parse(key, default.as_secs() / 3600)?;
        Ok(Duration::from_secs(hours.saturating_mul(3600)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<QueueConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        QueueConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.dedup_window, Duration::from_secs(3600));
        assert_eq!(config.role, ProcessRole::All);
    }

    #[test]
    fn reads_overrides() {
        let config = from_pairs(&[
            ("DMFLOW_MAX_CONCURRENT", "8"),
            ("DMFLOW_BATCH_SIZE", "4"),
            ("DMFLOW_MAX_RETRIES", "5"),
            ("DMFLOW_BACKOFF_BASE_MS", "250"),
            ("DMFLOW_RATE_LIMIT_PER_MINUTE", "120"),
            ("DMFLOW_JOB_TIMEOUT_MS", "1500"),
            ("DMFLOW_ROLE", "worker"),
            ("DMFLOW_SUCCESS_RATE_WARNING", "99.5"),
        ])
        .unwrap();
        assert_eq!(config.max_concurrent, 8);
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.rate_limit_per_minute, 120);
        assert_eq!(config.job_timeout, Duration::from_millis(1500));
        assert_eq!(config.role, ProcessRole::Worker);
        assert_eq!(config.health.success_rate_warning, 99.5);
    }

    #[test]
    fn rejects_garbage_values() {
        let err = from_pairs(&[("DMFLOW_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "DMFLOW_BATCH_SIZE", .. }));
        assert!(from_pairs(&[("DMFLOW_ROLE", "leader")]).is_err());
    }

    #[test]
    fn rejects_inconsistent_values() {
        assert!(matches!(
            from_pairs(&[("DMFLOW_MAX_CONCURRENT", "0")]),
            Err(ConfigError::Inconsistent(_))
        ));
        assert!(from_pairs(&[("DMFLOW_STALE_PROCESSING_SECS", "10")]).is_err());
        assert!(from_pairs(&[("DMFLOW_BACKOFF_BASE_MS", "900000")]).is_err());
    }
}
