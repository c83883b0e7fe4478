use std::time::Duration;

use thiserror::Error;

use crate::scheduler::LifecyclePhase;

/// Boxed error returned by job bodies, predicates and external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Lease duration {0:?} is outside the allowed range of 30s..=15m")]
    InvalidLeaseDuration(Duration),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Lifecycle phase {requested} cannot run after {last}")]
    PhaseOutOfOrder {
        requested: LifecyclePhase,
        last: LifecyclePhase,
    },

    #[error("Job {name} failed: {source}")]
    JobFailed {
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("Import job not found: {0}")]
    JobNotFound(String),

    #[error("Constraint {constraint} violated for import job {job_id}")]
    ConstraintViolation { job_id: String, constraint: String },

    #[error("Watermark {0} does not fit the store's counter range")]
    WatermarkOutOfRange(u64),

    #[error("Store conflict: {0}")]
    Conflict(String),

    #[error("Progress tracker is not running")]
    TrackerStopped,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    /// Serialization-style conflicts that resolve by running the same
    /// operation again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    /// Returns the violated constraint name, if this is a constraint violation.
    pub fn constraint(&self) -> Option<&str> {
        match self {
            Error::ConstraintViolation { constraint, .. } => Some(constraint),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
