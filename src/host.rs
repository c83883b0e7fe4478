use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::HostConfig;
use crate::db;
use crate::error::{BoxError, Result};
use crate::lease::{LeaseManager, SqliteLeaseStore};
use crate::progress::{ProgressTracker, SqliteImportJobStore};
use crate::scheduler::{Job, JobContext, JobRegistration, JobScheduler, LifecyclePhase};

pub const ENSURE_SCHEMA_JOB: &str = "ensure-schema";
pub const PROGRESS_REPORT_JOB: &str = "progress-report";

/// Wires the store, lease manager, progress tracker and scheduler of one
/// service instance.
pub struct Host {
    pool: SqlitePool,
    leases: Arc<LeaseManager>,
    tracker: ProgressTracker,
    scheduler: JobScheduler,
    shutdown: CancellationToken,
}

impl Host {
    /// Opens the configured database and assembles the host. The schema is
    /// created by the `ensure-schema` job when the host starts.
    pub async fn connect(config: HostConfig, shutdown: CancellationToken) -> Result<Self> {
        let pool = db::connect(&config.database_url).await?;
        Self::with_pool(config, pool, Arc::new(SystemClock), shutdown).await
    }

    pub async fn with_pool(
        config: HostConfig,
        pool: SqlitePool,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let lease_store = Arc::new(SqliteLeaseStore::new(pool.clone(), clock.clone()));
        let leases = Arc::new(LeaseManager::new(
            lease_store,
            clock.clone(),
            config.lease.clone(),
        )?);
        let tracker = ProgressTracker::spawn(
            Arc::new(SqliteImportJobStore::new(pool.clone())),
            config.tracker.clone(),
            &shutdown,
        );
        let scheduler = JobScheduler::new(
            config.scheduler.clone(),
            clock,
            Some(leases.clone()),
            &shutdown,
        );

        let schema_pool = pool.clone();
        scheduler
            .register(JobRegistration::lifecycle(
                ENSURE_SCHEMA_JOB,
                LifecyclePhase::Starting,
                move || EnsureSchemaJob {
                    pool: schema_pool.clone(),
                },
            ))
            .await?;

        Ok(Self {
            pool,
            leases,
            tracker,
            scheduler,
            shutdown,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Starts the host, waits for shutdown, then stops it.
    ///
    /// The stop phases run even when startup failed; the startup error wins
    /// if both fail.
    pub async fn run(&self) -> Result<()> {
        let started = self.scheduler.start().await;
        match &started {
            Ok(()) => {
                tracing::info!("Host started");
                self.shutdown.cancelled().await;
            }
            Err(e) => tracing::error!(error = %e, "Host failed to start"),
        }

        tracing::info!("Host stopping");
        let stopped = self.scheduler.stop().await;
        self.scheduler.dispose().await;
        self.tracker.stop().await;
        tracing::info!("Host stopped");

        started.and(stopped)
    }
}

struct EnsureSchemaJob {
    pool: SqlitePool,
}

#[async_trait]
impl Job for EnsureSchemaJob {
    async fn run(&mut self, _ctx: &JobContext) -> std::result::Result<(), BoxError> {
        db::ensure_schema(&self.pool).await?;
        Ok(())
    }
}

/// Logs the watermarks and backlog of a fixed set of import jobs.
pub struct ProgressReportJob {
    tracker: ProgressTracker,
    job_ids: Arc<[String]>,
}

impl ProgressReportJob {
    pub fn new(tracker: ProgressTracker, job_ids: impl Into<Arc<[String]>>) -> Self {
        Self {
            tracker,
            job_ids: job_ids.into(),
        }
    }

    /// Leased so only one instance reports per interval.
    pub fn registration(
        tracker: ProgressTracker,
        job_ids: Vec<String>,
        interval: Duration,
    ) -> JobRegistration {
        let job_ids: Arc<[String]> = job_ids.into();
        JobRegistration::scheduled(PROGRESS_REPORT_JOB, interval, move || {
            ProgressReportJob::new(tracker.clone(), job_ids.clone())
        })
        .with_lease(PROGRESS_REPORT_JOB)
    }
}

#[async_trait]
impl Job for ProgressReportJob {
    async fn run(&mut self, ctx: &JobContext) -> std::result::Result<(), BoxError> {
        for job_id in self.job_ids.iter() {
            if ctx.is_cancelled() {
                break;
            }
            match self.tracker.get_status(job_id).await? {
                Some(status) => tracing::info!(
                    job = %job_id,
                    source_max = status.source_max,
                    enqueued_max = status.enqueued_max,
                    processed_max = status.processed_max,
                    backlog = status.backlog(),
                    "Import job progress"
                ),
                None => tracing::info!(job = %job_id, "Import job has not started"),
            }
        }
        Ok(())
    }
}
