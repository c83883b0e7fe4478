use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};

use crate::clock::Clock;
use crate::config::check_lease_duration;
use crate::db::classify;
use crate::error::Result;
use crate::lease::{
    decide_acquire, decide_release, decide_renew, AcquireOutcome, LeaseRecord, LeaseRow,
    LeaseStore, LeaseTicket, ReleaseOutcome, RenewOutcome, Transition,
};
use crate::retry::{with_retry, StoreOperation};

/// Lease store over the shared `lease` table.
///
/// Each operation reads the row, decides, and writes inside one
/// transaction. Concurrent writers on the same id surface as busy errors,
/// which are retried and then re-decided against the winner's row.
#[derive(Clone)]
pub struct SqliteLeaseStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteLeaseStore {
    pub fn new(pool: SqlitePool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    async fn fetch(conn: &mut SqliteConnection, id: &str) -> Result<Option<LeaseRow>> {
        sqlx::query_as::<_, LeaseRow>(
            "SELECT token, expires, acquired, released FROM lease WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(classify)
    }

    async fn store(conn: &mut SqliteConnection, id: &str, row: &LeaseRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO lease (id, token, expires, acquired, released)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (id) DO UPDATE SET
                token = excluded.token,
                expires = excluded.expires,
                acquired = excluded.acquired,
                released = excluded.released",
        )
        .bind(id)
        .bind(row.token)
        .bind(row.expires)
        .bind(row.acquired)
        .bind(row.released)
        .execute(conn)
        .await
        .map_err(classify)?;
        Ok(())
    }

    /// Runs one read-decide-write cycle for `id` in a transaction.
    async fn transact<T>(
        &self,
        id: &str,
        decide: impl FnOnce(Option<&LeaseRow>) -> Transition<T>,
    ) -> Result<T> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        let row = Self::fetch(&mut tx, id).await?;
        let transition = decide(row.as_ref());
        if let Some(next) = &transition.write {
            Self::store(&mut tx, id, next).await?;
        }
        tx.commit().await.map_err(classify)?;
        Ok(transition.outcome)
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn try_acquire(
        &self,
        id: &str,
        duration: Duration,
        if_unacquired_for: Option<Duration>,
    ) -> Result<AcquireOutcome> {
        check_lease_duration(duration)?;
        let outcome = with_retry(StoreOperation::LeaseAcquire, move || {
            self.transact(id, move |row| {
                decide_acquire(id, row, self.clock.now(), duration, if_unacquired_for)
            })
        })
        .await?;
        if let AcquireOutcome::Acquired { ticket, .. } = &outcome {
            tracing::debug!(lease = id, expires = %ticket.expires, "Lease acquired");
        }
        Ok(outcome)
    }

    async fn try_renew(&self, ticket: &LeaseTicket, duration: Duration) -> Result<RenewOutcome> {
        check_lease_duration(duration)?;
        with_retry(StoreOperation::LeaseRenew, move || {
            self.transact(&ticket.lease_id, move |row| {
                decide_renew(ticket, row, self.clock.now(), duration)
            })
        })
        .await
    }

    async fn release(&self, ticket: &LeaseTicket) -> Result<ReleaseOutcome> {
        with_retry(StoreOperation::LeaseRelease, move || {
            self.transact(&ticket.lease_id, move |row| {
                decide_release(ticket, row, self.clock.now())
            })
        })
        .await
    }

    async fn describe(&self, id: &str) -> Result<Option<LeaseRecord>> {
        let mut conn = self.pool.acquire().await.map_err(classify)?;
        let row = Self::fetch(&mut conn, id).await?;
        Ok(row.map(|row| row.record(id, self.clock.now())))
    }
}
