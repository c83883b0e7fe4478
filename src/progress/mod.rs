//! Import job watermarks and the single-writer tracker that maintains them.
//!
//! An import job advances three monotonic counters: the highest upstream
//! change known (`source_max`), the highest change handed to the pipeline
//! (`enqueued_max`) and the highest change fully processed
//! (`processed_max`). The store enforces
//! `processed_max <= enqueued_max <= source_max`; writers only ever raise
//! counters, so racing instances converge on the maximum.

pub mod memory;
pub mod sqlite;
pub mod tracker;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::retry::{ENQUEUED_LE_SOURCE, PROCESSED_LE_ENQUEUED};

pub use memory::MemoryImportJobStore;
pub use sqlite::SqliteImportJobStore;
pub use tracker::ProgressTracker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportJobStatus {
    pub source_max: u64,
    pub enqueued_max: u64,
    pub processed_max: u64,
}

impl ImportJobStatus {
    /// Changes handed to the pipeline but not yet processed.
    pub fn backlog(&self) -> u64 {
        self.enqueued_max.saturating_sub(self.processed_max)
    }

    pub fn merge_queue(&self, update: QueueStatus) -> Self {
        Self {
            source_max: self.source_max.max(update.source_max),
            enqueued_max: self.enqueued_max.max(update.enqueued_max),
            processed_max: self.processed_max,
        }
    }

    pub fn merge_processed(&self, update: ProcessedStatus) -> Self {
        Self {
            processed_max: self.processed_max.max(update.processed_max),
            ..*self
        }
    }

    /// Name of the first ordering constraint this status breaks, if any.
    pub fn violated_constraint(&self) -> Option<&'static str> {
        if self.enqueued_max > self.source_max {
            Some(ENQUEUED_LE_SOURCE)
        } else if self.processed_max > self.enqueued_max {
            Some(PROCESSED_LE_ENQUEUED)
        } else {
            None
        }
    }

    /// True if writing `update` could not raise any counter.
    pub fn covers_queue(&self, update: &QueueStatus) -> bool {
        self.enqueued_max >= update.enqueued_max && self.source_max >= update.source_max
    }

    pub fn covers_processed(&self, update: &ProcessedStatus) -> bool {
        self.processed_max >= update.processed_max
    }
}

/// Queue-side progress reported by the importer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub enqueued_max: u64,
    pub source_max: u64,
}

/// Processing progress reported by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedStatus {
    pub processed_max: u64,
}

/// Result of a watermark write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrackOutcome {
    /// Whether this write raised a stored counter. False when someone had
    /// already advanced it at least as far.
    pub changed: bool,
    /// Authoritative row after the write.
    pub status: ImportJobStatus,
}

/// Source of connections to the `import_job` table.
#[async_trait]
pub trait ImportJobStore: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ImportJobConnection>>;
}

/// A held connection. Each merge is atomic and raises counters with `max`.
#[async_trait]
pub trait ImportJobConnection: Send {
    async fn get(&mut self, job_id: &str) -> Result<Option<ImportJobStatus>>;

    /// Creates the row if missing, then raises `enqueued_max` and `source_max`.
    async fn merge_queue_status(&mut self, job_id: &str, update: QueueStatus) -> Result<TrackOutcome>;

    /// Raises `processed_max`. Fails with `JobNotFound` if the row is missing.
    async fn merge_processed_status(
        &mut self,
        job_id: &str,
        update: ProcessedStatus,
    ) -> Result<TrackOutcome>;
}
