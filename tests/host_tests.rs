//! End-to-end tests for a host instance over SQLite.
//!
//! Verifies that:
//! - Startup creates the schema before any other job runs
//! - Scheduled leased jobs run against the shared database
//! - Shutdown runs the stop phases and stops the tracker
//! - A failed startup still runs the stop phases


use std::sync::Arc;
use std::time::Duration;

use registry_importer::clock::SystemClock;
use registry_importer::config::{HostConfig, SchedulerConfig};
use registry_importer::db;
use registry_importer::error::Error;
use registry_importer::host::{Host, ProgressReportJob, ENSURE_SCHEMA_JOB, PROGRESS_REPORT_JOB};
use registry_importer::progress::QueueStatus;
use registry_importer::scheduler::{JobRegistration, LifecyclePhase};
use tempfile::TempDir;
use test_harness::{assert_eventually, Behavior, EventLog, RecordingJob};
use tokio_util::sync::CancellationToken;

async fn host() -> (TempDir, Arc<Host>) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("registry.db").display());
    let pool = db::connect(&url).await.unwrap();
    let config = HostConfig::new(url).with_scheduler(SchedulerConfig {
        jitter: Duration::ZERO,
    });
    let host = Host::with_pool(config, pool, Arc::new(SystemClock), CancellationToken::new())
        .await
        .unwrap();
    (dir, Arc::new(host))
}

async fn table_exists(host: &Host, table: &str) -> bool {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .bind(table)
            .fetch_one(host.pool())
            .await
            .unwrap();
    count == 1
}

#[tokio::test]
async fn test_host_starts_reports_and_stops() {
    let (_dir, host) = host().await;
    let log = EventLog::default();

    assert!(host
        .scheduler()
        .job_names()
        .await
        .contains(&ENSURE_SCHEMA_JOB.to_string()));
    assert!(!table_exists(&host, "import_job").await);

    host.scheduler()
        .register(ProgressReportJob::registration(
            host.tracker().clone(),
            vec!["npm".to_string()],
            Duration::from_secs(60),
        ))
        .await
        .unwrap();
    host.scheduler()
        .register(JobRegistration::lifecycle(
            "goodbye",
            LifecyclePhase::Stopping,
            RecordingJob::factory("goodbye", &log, None, Behavior::Succeed),
        ))
        .await
        .unwrap();

    let runner = {
        let host = host.clone();
        tokio::spawn(async move { host.run().await })
    };

    assert_eventually(
        || async { host.scheduler().last_phase().await == Some(LifecyclePhase::Started) },
        Duration::from_secs(5),
        "host should reach the started phase",
    )
    .await;
    assert!(table_exists(&host, "lease").await);
    assert!(table_exists(&host, "import_job").await);

    host.tracker()
        .track_queue_status(
            "npm",
            QueueStatus {
                enqueued_max: 3,
                source_max: 5,
            },
        )
        .await
        .unwrap();

    // With no jitter the leased report runs right after start.
    let store = host.leases().store().clone();
    assert_eventually(
        || {
            let store = store.clone();
            async move {
                matches!(
                    store.describe(PROGRESS_REPORT_JOB).await,
                    Ok(Some(record)) if record.released_at.is_some()
                )
            }
        },
        Duration::from_secs(5),
        "progress report should take and release its lease",
    )
    .await;

    host.shutdown_token().cancel();
    runner.await.unwrap().unwrap();

    assert_eq!(log.events(), vec!["run:goodbye", "dispose:goodbye"]);
    assert_eq!(
        host.scheduler().last_phase().await,
        Some(LifecyclePhase::Stopped)
    );
    assert!(host.tracker().is_stopped());
}

#[tokio::test]
async fn test_failed_start_still_stops() {
    let (_dir, host) = host().await;
    let log = EventLog::default();

    host.scheduler()
        .register(JobRegistration::lifecycle(
            "warm-cache",
            LifecyclePhase::Start,
            RecordingJob::factory("warm-cache", &log, None, Behavior::Fail),
        ))
        .await
        .unwrap();
    host.scheduler()
        .register(JobRegistration::lifecycle(
            "flush",
            LifecyclePhase::Stop,
            RecordingJob::factory("flush", &log, None, Behavior::Succeed),
        ))
        .await
        .unwrap();

    let err = host.run().await.unwrap_err();
    assert!(matches!(err, Error::JobFailed { ref name, .. } if name == "warm-cache"));

    assert_eq!(log.count("run:flush"), 1);
    assert_eq!(
        host.scheduler().last_phase().await,
        Some(LifecyclePhase::Stopped)
    );
    assert!(host.tracker().is_stopped());
}
