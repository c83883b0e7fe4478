use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, Sqlite, SqliteConnection, SqlitePool};

use crate::db::{classify, classify_write};
use crate::error::{Error, Result};
use crate::progress::{
    ImportJobConnection, ImportJobStatus, ImportJobStore, ProcessedStatus, QueueStatus,
    TrackOutcome,
};

#[derive(sqlx::FromRow)]
struct StatusRow {
    source_max: i64,
    enqueued_max: i64,
    processed_max: i64,
}

impl From<StatusRow> for ImportJobStatus {
    fn from(row: StatusRow) -> Self {
        // The table's CHECK constraints keep every counter non-negative.
        Self {
            source_max: row.source_max.max(0) as u64,
            enqueued_max: row.enqueued_max.max(0) as u64,
            processed_max: row.processed_max.max(0) as u64,
        }
    }
}

fn to_db(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::WatermarkOutOfRange(value))
}

/// `import_job` table access through pooled connections.
#[derive(Clone)]
pub struct SqliteImportJobStore {
    pool: SqlitePool,
}

impl SqliteImportJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImportJobStore for SqliteImportJobStore {
    async fn connect(&self) -> Result<Box<dyn ImportJobConnection>> {
        let conn = self.pool.acquire().await.map_err(classify)?;
        Ok(Box::new(SqliteImportJobConnection { conn }))
    }
}

struct SqliteImportJobConnection {
    conn: PoolConnection<Sqlite>,
}

async fn fetch(conn: &mut SqliteConnection, job_id: &str) -> Result<Option<ImportJobStatus>> {
    let row = sqlx::query_as::<_, StatusRow>(
        "SELECT source_max, enqueued_max, processed_max FROM import_job WHERE id = ?1",
    )
    .bind(job_id)
    .fetch_optional(conn)
    .await
    .map_err(classify)?;
    Ok(row.map(Into::into))
}

#[async_trait]
impl ImportJobConnection for SqliteImportJobConnection {
    async fn get(&mut self, job_id: &str) -> Result<Option<ImportJobStatus>> {
        fetch(&mut self.conn, job_id).await
    }

    async fn merge_queue_status(&mut self, job_id: &str, update: QueueStatus) -> Result<TrackOutcome> {
        let enqueued = to_db(update.enqueued_max)?;
        let source = to_db(update.source_max)?;

        let mut tx = self.conn.begin().await.map_err(classify)?;
        let before = fetch(&mut tx, job_id).await?;
        let after: ImportJobStatus = sqlx::query_as::<_, StatusRow>(
            "INSERT INTO import_job (id, source_max, enqueued_max, processed_max)
             VALUES (?1, ?2, ?3, 0)
             ON CONFLICT (id) DO UPDATE SET
                source_max = max(source_max, excluded.source_max),
                enqueued_max = max(enqueued_max, excluded.enqueued_max)
             RETURNING source_max, enqueued_max, processed_max",
        )
        .bind(job_id)
        .bind(source)
        .bind(enqueued)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| classify_write(e, job_id))?
        .into();
        tx.commit().await.map_err(classify)?;

        Ok(TrackOutcome {
            changed: before != Some(after),
            status: after,
        })
    }

    async fn merge_processed_status(
        &mut self,
        job_id: &str,
        update: ProcessedStatus,
    ) -> Result<TrackOutcome> {
        let processed = to_db(update.processed_max)?;

        let mut tx = self.conn.begin().await.map_err(classify)?;
        let Some(before) = fetch(&mut tx, job_id).await? else {
            return Err(Error::JobNotFound(job_id.to_string()));
        };
        let after: ImportJobStatus = sqlx::query_as::<_, StatusRow>(
            "UPDATE import_job SET processed_max = max(processed_max, ?2)
             WHERE id = ?1
             RETURNING source_max, enqueued_max, processed_max",
        )
        .bind(job_id)
        .bind(processed)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| classify_write(e, job_id))?
        .ok_or_else(|| Error::JobNotFound(job_id.to_string()))?
        .into();
        tx.commit().await.map_err(classify)?;

        Ok(TrackOutcome {
            changed: before != after,
            status: after,
        })
    }
}
