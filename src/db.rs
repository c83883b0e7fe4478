//! SQLite pool setup, schema and error classification.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::{Error, Result};

const MAX_CONNECTIONS: u32 = 8;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const CHECK_FAILED_PREFIX: &str = "CHECK constraint failed: ";

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS lease (
        id       TEXT PRIMARY KEY NOT NULL,
        token    BLOB NULL,
        expires  TEXT NOT NULL,
        acquired TEXT NULL,
        released TEXT NULL
    )",
    "CREATE TABLE IF NOT EXISTS import_job (
        id            TEXT PRIMARY KEY NOT NULL,
        source_max    INTEGER NOT NULL DEFAULT 0
            CONSTRAINT source_max_non_negative CHECK (source_max >= 0),
        enqueued_max  INTEGER NOT NULL DEFAULT 0
            CONSTRAINT enqueued_max_non_negative CHECK (enqueued_max >= 0),
        processed_max INTEGER NOT NULL DEFAULT 0
            CONSTRAINT processed_max_non_negative CHECK (processed_max >= 0),
        CONSTRAINT enqueued_max_less_than_or_equal_to_source_max
            CHECK (enqueued_max <= source_max),
        CONSTRAINT processed_max_less_than_or_equal_to_enqueued_max
            CHECK (processed_max <= enqueued_max)
    )",
];

/// Opens a pool against `url`, creating the database file if needed.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(MAX_CONNECTIONS)
        .connect_with(options)
        .await?;
    tracing::debug!(url, "Opened database pool");
    Ok(pool)
}

/// Creates the `lease` and `import_job` tables if they do not exist.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    tracing::info!("Database schema ready");
    Ok(())
}

/// Maps busy/locked failures to [`Error::Conflict`] so they are retried.
pub(crate) fn classify(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        let primary = db_err
            .code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| code & 0xff);
        if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
            return Error::Conflict(db_err.message().to_string());
        }
    }
    Error::Database(err)
}

/// Like [`classify`], additionally surfacing named CHECK failures on an
/// `import_job` row as [`Error::ConstraintViolation`].
pub(crate) fn classify_write(err: sqlx::Error, job_id: &str) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some((_, name)) = db_err.message().split_once(CHECK_FAILED_PREFIX) {
            return Error::ConstraintViolation {
                job_id: job_id.to_string(),
                constraint: name.trim().to_string(),
            };
        }
    }
    classify(err)
}
