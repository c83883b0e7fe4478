use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::progress::{
    ImportJobConnection, ImportJobStatus, ImportJobStore, ProcessedStatus, QueueStatus,
    TrackOutcome,
};
use crate::retry::{Retrier, StoreOperation};

enum TrackerMessage {
    GetStatus {
        job_id: String,
        response_tx: oneshot::Sender<Result<Option<ImportJobStatus>>>,
    },
    TrackQueue {
        job_id: String,
        update: QueueStatus,
        response_tx: oneshot::Sender<Result<TrackOutcome>>,
    },
    TrackProcessed {
        job_id: String,
        update: ProcessedStatus,
        response_tx: oneshot::Sender<Result<TrackOutcome>>,
    },
    ClearCache {
        job_id: String,
        response_tx: oneshot::Sender<Result<()>>,
    },
}

/// Serializes every read and write of import job watermarks through one
/// worker task.
///
/// The worker keeps a cache of the last authoritative row per job and skips
/// writes that cannot raise a counter. It holds a single store connection
/// while requests keep arriving and gives it back after
/// `idle_connection_timeout` without traffic.
///
/// Cloning is cheap; all clones talk to the same worker.
#[derive(Clone)]
pub struct ProgressTracker {
    message_tx: mpsc::Sender<TrackerMessage>,
    stop: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ProgressTracker {
    /// Spawns the worker. It exits when `shutdown` fires or [`stop`](Self::stop) is called.
    pub fn spawn(
        store: Arc<dyn ImportJobStore>,
        config: TrackerConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        let (message_tx, message_rx) = mpsc::channel(config.queue_capacity.max(1));
        let stop = shutdown.child_token();
        let worker = Worker {
            store,
            config,
            cache: HashMap::new(),
            conn: None,
        };
        let handle = tokio::spawn(worker.run(message_rx, stop.clone()));

        Self {
            message_tx,
            stop,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Reads the stored row and refreshes the cache from it.
    pub async fn get_status(&self, job_id: &str) -> Result<Option<ImportJobStatus>> {
        let job_id = job_id.to_string();
        self.call(|response_tx| TrackerMessage::GetStatus {
            job_id,
            response_tx,
        })
        .await
    }

    pub async fn track_queue_status(&self, job_id: &str, update: QueueStatus) -> Result<TrackOutcome> {
        let job_id = job_id.to_string();
        self.call(|response_tx| TrackerMessage::TrackQueue {
            job_id,
            update,
            response_tx,
        })
        .await
    }

    pub async fn track_processed_status(
        &self,
        job_id: &str,
        update: ProcessedStatus,
    ) -> Result<TrackOutcome> {
        let job_id = job_id.to_string();
        self.call(|response_tx| TrackerMessage::TrackProcessed {
            job_id,
            update,
            response_tx,
        })
        .await
    }

    /// Forgets the cached row so the next write goes to the store.
    pub async fn clear_cache(&self, job_id: &str) -> Result<()> {
        let job_id = job_id.to_string();
        self.call(|response_tx| TrackerMessage::ClearCache {
            job_id,
            response_tx,
        })
        .await
    }

    /// Stops the worker and waits for it to exit. Queued requests fail with
    /// [`Error::TrackerStopped`].
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Progress tracker worker failed");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled() || self.message_tx.is_closed()
    }

    async fn call<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<Result<T>>) -> TrackerMessage,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.message_tx
            .send(message(response_tx))
            .await
            .map_err(|_| Error::TrackerStopped)?;
        response_rx.await.map_err(|_| Error::TrackerStopped)?
    }
}

struct Worker {
    store: Arc<dyn ImportJobStore>,
    config: TrackerConfig,
    cache: HashMap<String, ImportJobStatus>,
    conn: Option<Box<dyn ImportJobConnection>>,
}

impl Worker {
    async fn run(mut self, mut message_rx: mpsc::Receiver<TrackerMessage>, stop: CancellationToken) {
        tracing::debug!("Progress tracker started");
        loop {
            let holding = self.conn.is_some();
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                message = message_rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => break,
                },
                _ = tokio::time::sleep(self.config.idle_connection_timeout), if holding => {
                    tracing::trace!("Releasing idle tracker connection");
                    self.conn = None;
                }
            }
        }
        tracing::debug!("Progress tracker stopped");
    }

    async fn handle(&mut self, message: TrackerMessage) {
        match message {
            TrackerMessage::GetStatus {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.get_status(&job_id).await);
            }
            TrackerMessage::TrackQueue {
                job_id,
                update,
                response_tx,
            } => {
                let _ = response_tx.send(self.track_queue(&job_id, update).await);
            }
            TrackerMessage::TrackProcessed {
                job_id,
                update,
                response_tx,
            } => {
                let _ = response_tx.send(self.track_processed(&job_id, update).await);
            }
            TrackerMessage::ClearCache {
                job_id,
                response_tx,
            } => {
                self.cache.remove(&job_id);
                let _ = response_tx.send(Ok(()));
            }
        }
    }

    async fn connection(&mut self) -> Result<&mut Box<dyn ImportJobConnection>> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.store.connect().await?,
        };
        Ok(self.conn.insert(conn))
    }

    /// Drops the held connection after a failure that may have broken it.
    fn after_failure(&mut self, err: &Error) {
        if matches!(err, Error::Database(_)) {
            self.conn = None;
        }
    }

    async fn get_status(&mut self, job_id: &str) -> Result<Option<ImportJobStatus>> {
        let mut retrier = Retrier::new(StoreOperation::ReadStatus);
        loop {
            let result = match self.connection().await {
                Ok(conn) => conn.get(job_id).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(status) => {
                    match status {
                        Some(status) => self.cache.insert(job_id.to_string(), status),
                        None => self.cache.remove(job_id),
                    };
                    return Ok(status);
                }
                Err(e) => {
                    self.after_failure(&e);
                    retrier.backoff(e).await?;
                }
            }
        }
    }

    async fn track_queue(&mut self, job_id: &str, update: QueueStatus) -> Result<TrackOutcome> {
        if let Some(cached) = self.cache.get(job_id) {
            if cached.covers_queue(&update) {
                tracing::trace!(job = job_id, ?update, "Queue status already covered");
                return Ok(TrackOutcome {
                    changed: false,
                    status: *cached,
                });
            }
        }

        let mut retrier = Retrier::new(StoreOperation::TrackQueue);
        loop {
            let result = match self.connection().await {
                Ok(conn) => conn.merge_queue_status(job_id, update).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => return Ok(self.remember(job_id, outcome)),
                Err(e) => {
                    self.after_failure(&e);
                    retrier.backoff(e).await?;
                }
            }
        }
    }

    async fn track_processed(&mut self, job_id: &str, update: ProcessedStatus) -> Result<TrackOutcome> {
        if let Some(cached) = self.cache.get(job_id) {
            if cached.covers_processed(&update) {
                tracing::trace!(job = job_id, ?update, "Processed status already covered");
                return Ok(TrackOutcome {
                    changed: false,
                    status: *cached,
                });
            }
        }

        let mut retrier = Retrier::new(StoreOperation::TrackProcessed);
        loop {
            let result = match self.connection().await {
                Ok(conn) => conn.merge_processed_status(job_id, update).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => return Ok(self.remember(job_id, outcome)),
                Err(e) => {
                    self.after_failure(&e);
                    retrier.backoff(e).await?;
                }
            }
        }
    }

    fn remember(&mut self, job_id: &str, outcome: TrackOutcome) -> TrackOutcome {
        self.cache.insert(job_id.to_string(), outcome.status);
        if outcome.changed {
            tracing::debug!(job = job_id, status = ?outcome.status, "Import job progress advanced");
        }
        outcome
    }
}
