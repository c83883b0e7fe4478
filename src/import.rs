//! Periodic import of upstream changes into the processing pipeline.
//!
//! [`ImportPollJob`] pages through a [`ChangeSource`] starting after the
//! job's `enqueued_max`, hands each page to an [`ImportSink`] and records
//! how far it got through the [`ProgressTracker`]. Consumers downstream of
//! the sink report completion with `track_processed_status`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BoxError;
use crate::progress::{ProgressTracker, QueueStatus};
use crate::scheduler::{Job, JobContext, JobRegistration};

/// Tag carried by every import job registration.
pub const IMPORT_TAG: &str = "import";

const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Upstream sequence number; strictly increasing within a source.
    pub sequence: u64,
    pub record_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePage {
    /// Changes after the requested sequence, in ascending order.
    pub changes: Vec<Change>,
    /// Highest sequence the source currently knows about.
    pub latest: u64,
}

/// Upstream system the changes are read from.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn changes_after(&self, sequence: u64, limit: usize) -> Result<ChangePage, BoxError>;
}

/// Pipeline entry the changes are handed to.
#[async_trait]
pub trait ImportSink: Send + Sync {
    async fn enqueue(&self, job_id: &str, changes: &[Change]) -> Result<(), BoxError>;
}

pub struct ImportPollJob {
    job_id: String,
    source: Arc<dyn ChangeSource>,
    sink: Arc<dyn ImportSink>,
    tracker: ProgressTracker,
    batch_size: usize,
}

impl ImportPollJob {
    pub fn new(
        job_id: impl Into<String>,
        source: Arc<dyn ChangeSource>,
        sink: Arc<dyn ImportSink>,
        tracker: ProgressTracker,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            source,
            sink,
            tracker,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Lease name guarding the import of `job_id` across instances.
    pub fn lease_name(job_id: &str) -> String {
        format!("import:{}", job_id)
    }

    /// A leased, tagged registration that polls every `interval`.
    pub fn registration(
        job_id: &str,
        interval: Duration,
        source: Arc<dyn ChangeSource>,
        sink: Arc<dyn ImportSink>,
        tracker: ProgressTracker,
    ) -> JobRegistration {
        let id = job_id.to_string();
        JobRegistration::scheduled(format!("import-poll:{}", job_id), interval, move || {
            ImportPollJob::new(id.clone(), source.clone(), sink.clone(), tracker.clone())
        })
        .with_lease(Self::lease_name(job_id))
        .with_tag(IMPORT_TAG)
    }

    /// Imports one page. Returns false once the source has nothing newer.
    async fn import_page(&self) -> Result<bool, BoxError> {
        let status = self
            .tracker
            .get_status(&self.job_id)
            .await?
            .unwrap_or_default();

        let page = self
            .source
            .changes_after(status.enqueued_max, self.batch_size)
            .await?;

        let Some(last) = page.changes.iter().map(|c| c.sequence).max() else {
            if page.latest > status.source_max {
                self.tracker
                    .track_queue_status(
                        &self.job_id,
                        QueueStatus {
                            enqueued_max: status.enqueued_max,
                            source_max: page.latest,
                        },
                    )
                    .await?;
            }
            return Ok(false);
        };

        if last <= status.enqueued_max {
            tracing::warn!(
                job = %self.job_id,
                after = status.enqueued_max,
                last,
                "Source returned no changes past the enqueued watermark"
            );
            return Ok(false);
        }

        self.sink.enqueue(&self.job_id, &page.changes).await?;

        let outcome = self
            .tracker
            .track_queue_status(
                &self.job_id,
                QueueStatus {
                    enqueued_max: last,
                    source_max: page.latest.max(last),
                },
            )
            .await?;

        tracing::info!(
            job = %self.job_id,
            changes = page.changes.len(),
            enqueued_max = outcome.status.enqueued_max,
            source_max = outcome.status.source_max,
            "Enqueued upstream changes"
        );
        Ok(true)
    }
}

#[async_trait]
impl Job for ImportPollJob {
    async fn run(&mut self, ctx: &JobContext) -> Result<(), BoxError> {
        while !ctx.is_cancelled() {
            if !self.import_page().await? {
                break;
            }
        }
        Ok(())
    }
}
