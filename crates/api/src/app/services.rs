use std::sync::{Arc, RwLock};

use anyhow::Context;

use dmflow_core::WorkerId;
use dmflow_infra::{
    InMemoryJobStore, InMemoryRateLimiter, Ingestor, JobHandler, JobStore, Maintenance,
    MaintenanceConfig, MaintenanceHandle, PostgresJobStore, QueueConfig, RateLimiter,
    StatsReporter, StatsReporterHandle, Worker, WorkerConfig, WorkerHandle,
    rate_limit::RedisRateLimiter,
    shutdown_all,
    worker::{WorkerStats, WorkerStatsSnapshot},
};

/// Secrets and tokens for the HTTP surface.
#[derive(Debug, Clone, Default)]
pub struct AppSettings {
    /// Instagram app secret; signature checks are skipped when unset.
    pub app_secret: Option<String>,
    /// Token expected in the subscription handshake.
    pub verify_token: Option<String>,
    /// Bearer token for `/admin`; admin routes reject every request when unset.
    pub admin_token: Option<String>,
}

impl AppSettings {
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let settings = Self {
            app_secret: non_empty("INSTAGRAM_APP_SECRET"),
            verify_token: non_empty("INSTAGRAM_VERIFY_TOKEN"),
            admin_token: non_empty("ADMIN_TOKEN"),
        };
        if settings.app_secret.is_none() {
            tracing::warn!("INSTAGRAM_APP_SECRET not set; webhook signatures will not be verified");
        }
        if settings.admin_token.is_none() {
            tracing::warn!("ADMIN_TOKEN not set; admin endpoints are disabled");
        }
        settings
    }
}

pub struct AppServices {
    pub config: QueueConfig,
    pub settings: AppSettings,
    store: Arc<dyn JobStore>,
    limiter: Option<Arc<dyn RateLimiter>>,
    ingestor: Ingestor,
    maintenance: Maintenance,
    reporter: Arc<StatsReporter>,
    workers: RwLock<Vec<(WorkerId, Arc<WorkerStats>)>>,
}

impl AppServices {
    pub fn new(
        config: QueueConfig,
        settings: AppSettings,
        store: Arc<dyn JobStore>,
        limiter: Option<Arc<dyn RateLimiter>>,
    ) -> Self {
        let ingestor = Ingestor::from_queue_config(store.clone(), &config);
        let maintenance = Maintenance::new(store.clone(), MaintenanceConfig::from_queue_config(&config));
        let reporter = Arc::new(StatsReporter::from_queue_config(store.clone(), &config));
        Self {
            config,
            settings,
            store,
            limiter,
            ingestor,
            maintenance,
            reporter,
            workers: RwLock::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn maintenance(&self) -> &Maintenance {
        &self.maintenance
    }

    pub fn reporter(&self) -> &Arc<StatsReporter> {
        &self.reporter
    }

    /// Make a worker's counters visible on the stats endpoint.
    pub fn register_worker(&self, handle: &WorkerHandle) {
        if let Ok(mut workers) = self.workers.write() {
            workers.push((handle.id().clone(), handle.shared_stats()));
        }
    }

    pub fn worker_stats(&self) -> Vec<(WorkerId, WorkerStatsSnapshot)> {
        self.workers
            .read()
            .map(|workers| {
                workers
                    .iter()
                    .map(|(id, stats)| (id.clone(), stats.snapshot()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Pick the backends from `USE_PERSISTENT_STORES`.
pub async fn build_services(config: QueueConfig, settings: AppSettings) -> anyhow::Result<AppServices> {
    let use_persistent = std::env::var("USE_PERSISTENT_STORES")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    if use_persistent {
        return build_persistent_services(config, settings).await;
    }
    Ok(build_in_memory_services(config, settings))
}

/// In-memory store and limiter (dev/test). State is lost on restart.
pub fn build_in_memory_services(config: QueueConfig, settings: AppSettings) -> AppServices {
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new(config.retry.clone()));
    let limiter = (config.rate_limit_per_minute > 0).then(|| {
        Arc::new(InMemoryRateLimiter::new(config.rate_limit_per_minute)) as Arc<dyn RateLimiter>
    });
    tracing::info!(role = ?config.role, "using in-memory job store");
    AppServices::new(config, settings, store, limiter)
}

/// Postgres job store, Redis rate limiter.
pub async fn build_persistent_services(config: QueueConfig, settings: AppSettings) -> anyhow::Result<AppServices> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
    let read_url = std::env::var("DATABASE_READ_URL").ok();

    let store = PostgresJobStore::connect(
        &database_url,
        read_url.as_deref(),
        pool_size(&config),
        config.retry.clone(),
    )
    .await
    .context("failed to connect to Postgres")?;
    store.ensure_schema().await.context("failed to apply queue schema")?;

    let limiter = if config.rate_limit_per_minute > 0 {
        let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let limiter = RedisRateLimiter::connect(&redis_url, config.rate_limit_per_minute)
            .await
            .context("failed to connect to Redis")?;
        Some(Arc::new(limiter) as Arc<dyn RateLimiter>)
    } else {
        None
    };

    tracing::info!(role = ?config.role, replica = read_url.is_some(), "using Postgres job store");
    Ok(AppServices::new(config, settings, Arc::new(store), limiter))
}

/// One connection per claim loop plus headroom for resolves, ingestion and maintenance.
fn pool_size(config: &QueueConfig) -> u32 {
    let workers = if config.role.runs_workers() { config.workers } else { 0 };
    u32::try_from(workers * 4 + 8).unwrap_or(u32::MAX)
}

/// Long-running tasks owned by the process.
pub struct BackgroundTasks {
    workers: Vec<WorkerHandle>,
    maintenance: Option<MaintenanceHandle>,
    reporter: StatsReporterHandle,
}

/// Start claim loops and maintenance (when the role runs workers) and the stats reporter.
pub fn start_background(services: &AppServices, handler: Arc<dyn JobHandler>) -> BackgroundTasks {
    let config = &services.config;
    let mut workers = Vec::new();
    let mut maintenance = None;

    if config.role.runs_workers() {
        for _ in 0..config.workers.max(1) {
            let mut worker = Worker::new(
                services.store.clone(),
                handler.clone(),
                WorkerConfig::from_queue_config(config),
            )
            .with_id(WorkerId::generate("worker"));
            if let Some(limiter) = &services.limiter {
                worker = worker.with_rate_limiter(limiter.clone());
            }
            let handle = worker.spawn();
            services.register_worker(&handle);
            workers.push(handle);
        }
        maintenance = Some(services.maintenance.clone().spawn());
    }

    let reporter = services.reporter.clone().spawn(config.stats_interval);
    tracing::info!(workers = workers.len(), role = ?config.role, "background tasks started");

    BackgroundTasks {
        workers,
        maintenance,
        reporter,
    }
}

impl BackgroundTasks {
    /// Drain workers, then stop maintenance and reporting.
    pub async fn shutdown(self) {
        shutdown_all(self.workers).await;
        if let Some(maintenance) = self.maintenance {
            maintenance.shutdown().await;
        }
        self.reporter.shutdown().await;
        tracing::info!("background tasks stopped");
    }
}
