use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::progress::{
    ImportJobConnection, ImportJobStatus, ImportJobStore, ProcessedStatus, QueueStatus,
    TrackOutcome,
};

#[derive(Default)]
struct Shared {
    rows: Mutex<HashMap<String, ImportJobStatus>>,
    connections: AtomicUsize,
    writes: AtomicUsize,
    injected_conflicts: AtomicUsize,
}

impl Shared {
    /// Counts a write attempt, failing it if a conflict was injected.
    fn begin_write(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(Error::Conflict("injected write conflict".to_string())),
            Err(_) => Ok(()),
        }
    }
}

/// Process-local import job table applying the same constraints as the
/// database, with counters for observing how the tracker uses it.
#[derive(Clone, Default)]
pub struct MemoryImportJobStore {
    shared: Arc<Shared>,
}

impl MemoryImportJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections opened so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Write attempts that reached the store, including failed ones.
    pub fn writes(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Fails the next `count` write attempts with a transient conflict.
    pub fn inject_conflicts(&self, count: usize) {
        self.shared.injected_conflicts.store(count, Ordering::SeqCst);
    }

    pub async fn insert(&self, job_id: &str, status: ImportJobStatus) {
        self.shared
            .rows
            .lock()
            .await
            .insert(job_id.to_string(), status);
    }

    pub async fn status(&self, job_id: &str) -> Option<ImportJobStatus> {
        self.shared.rows.lock().await.get(job_id).copied()
    }
}

#[async_trait]
impl ImportJobStore for MemoryImportJobStore {
    async fn connect(&self) -> Result<Box<dyn ImportJobConnection>> {
        self.shared.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
}

impl MemoryConnection {
    async fn merge(
        &self,
        job_id: &str,
        merge: impl FnOnce(Option<&ImportJobStatus>) -> Result<ImportJobStatus>,
    ) -> Result<TrackOutcome> {
        self.shared.begin_write()?;
        let mut rows = self.shared.rows.lock().await;
        let before = rows.get(job_id).copied();
        let after = merge(before.as_ref())?;
        if let Some(constraint) = after.violated_constraint() {
            return Err(Error::ConstraintViolation {
                job_id: job_id.to_string(),
                constraint: constraint.to_string(),
            });
        }
        rows.insert(job_id.to_string(), after);
        Ok(TrackOutcome {
            changed: before != Some(after),
            status: after,
        })
    }
}

#[async_trait]
impl ImportJobConnection for MemoryConnection {
    async fn get(&mut self, job_id: &str) -> Result<Option<ImportJobStatus>> {
        Ok(self.shared.rows.lock().await.get(job_id).copied())
    }

    async fn merge_queue_status(&mut self, job_id: &str, update: QueueStatus) -> Result<TrackOutcome> {
        self.merge(job_id, |row| {
            Ok(row.copied().unwrap_or_default().merge_queue(update))
        })
        .await
    }

    async fn merge_processed_status(
        &mut self,
        job_id: &str,
        update: ProcessedStatus,
    ) -> Result<TrackOutcome> {
        self.merge(job_id, |row| match row {
            Some(row) => Ok(row.merge_processed(update)),
            None => Err(Error::JobNotFound(job_id.to_string())),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_write_creates_and_raises() {
        let store = MemoryImportJobStore::new();
        let mut conn = store.connect().await.unwrap();

        let first = conn
            .merge_queue_status(
                "job-a",
                QueueStatus {
                    enqueued_max: 2,
                    source_max: 2,
                },
            )
            .await
            .unwrap();
        assert!(first.changed);

        let again = conn
            .merge_queue_status(
                "job-a",
                QueueStatus {
                    enqueued_max: 1,
                    source_max: 2,
                },
            )
            .await
            .unwrap();
        assert!(!again.changed);
        assert_eq!(again.status.enqueued_max, 2);
    }

    #[tokio::test]
    async fn processed_write_needs_existing_row() {
        let store = MemoryImportJobStore::new();
        let mut conn = store.connect().await.unwrap();
        let err = conn
            .merge_processed_status("missing", ProcessedStatus { processed_max: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));
    }

    #[tokio::test]
    async fn processed_past_enqueued_is_rejected() {
        let store = MemoryImportJobStore::new();
        store
            .insert(
                "job-a",
                ImportJobStatus {
                    source_max: 2,
                    enqueued_max: 2,
                    processed_max: 0,
                },
            )
            .await;
        let mut conn = store.connect().await.unwrap();
        let err = conn
            .merge_processed_status("job-a", ProcessedStatus { processed_max: 5 })
            .await
            .unwrap_err();
        assert_eq!(
            err.constraint(),
            Some("processed_max_less_than_or_equal_to_enqueued_max")
        );
        assert_eq!(store.status("job-a").await.unwrap().processed_max, 0);
    }

    #[tokio::test]
    async fn injected_conflicts_fail_writes() {
        let store = MemoryImportJobStore::new();
        store.inject_conflicts(1);
        let mut conn = store.connect().await.unwrap();
        let update = QueueStatus {
            enqueued_max: 1,
            source_max: 1,
        };
        assert!(conn
            .merge_queue_status("job-a", update)
            .await
            .unwrap_err()
            .is_transient());
        assert!(conn.merge_queue_status("job-a", update).await.is_ok());
        assert_eq!(store.writes(), 2);
    }
}
