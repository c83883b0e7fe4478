use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;
use crate::scheduler::LifecyclePhase;

/// A unit of work run by the scheduler.
///
/// A fresh instance is built from the registration's factory for every run
/// and disposed right after it, whether the run succeeded or not.
#[async_trait]
pub trait Job: Send {
    async fn run(&mut self, ctx: &JobContext) -> Result<(), BoxError>;

    /// Tears the instance down after a run. Errors are logged, never propagated.
    async fn dispose(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Why a job is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTrigger {
    Phase(LifecyclePhase),
    Interval,
}

impl fmt::Display for JobTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobTrigger::Phase(phase) => write!(f, "{}", phase),
            JobTrigger::Interval => write!(f, "interval"),
        }
    }
}

/// Per-run information handed to [`Job::run`].
#[derive(Debug, Clone)]
pub struct JobContext {
    pub name: String,
    pub trigger: JobTrigger,
    /// Lease the run holds, if the registration names one.
    pub lease_name: Option<String>,
    /// Fires when the lease is lost or the scheduler is shutting down.
    /// Runs in the stop phases only see lease loss.
    /// Long-running jobs should stop at the next safe point.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
