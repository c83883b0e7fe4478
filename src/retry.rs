use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Named constraint that fails when `enqueued_max` runs ahead of `source_max`.
pub const ENQUEUED_LE_SOURCE: &str = "enqueued_max_less_than_or_equal_to_source_max";
/// Named constraint that fails when `processed_max` runs ahead of `enqueued_max`.
pub const PROCESSED_LE_ENQUEUED: &str = "processed_max_less_than_or_equal_to_enqueued_max";

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Constant(Duration),
    /// `step * n` before the n-th retry.
    Linear(Duration),
}

/// Bounded retry strategy for store operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn constant(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Constant(delay),
        }
    }

    pub const fn linear(attempts: u32, step: Duration) -> Self {
        Self {
            attempts,
            backoff: Backoff::Linear(step),
        }
    }

    /// Delay before retry number `retry` (1-based), or `None` once the
    /// attempt budget is spent.
    pub fn delay_before(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry >= self.attempts {
            return None;
        }
        Some(match self.backoff {
            Backoff::Constant(delay) => delay,
            Backoff::Linear(step) => step.saturating_mul(retry),
        })
    }
}

/// Store operations that share the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    LeaseAcquire,
    LeaseRenew,
    LeaseRelease,
    ReadStatus,
    TrackQueue,
    TrackProcessed,
}

impl StoreOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreOperation::LeaseAcquire => "lease_acquire",
            StoreOperation::LeaseRenew => "lease_renew",
            StoreOperation::LeaseRelease => "lease_release",
            StoreOperation::ReadStatus => "read_status",
            StoreOperation::TrackQueue => "track_queue",
            StoreOperation::TrackProcessed => "track_processed",
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        match self {
            StoreOperation::LeaseAcquire
            | StoreOperation::LeaseRenew
            | StoreOperation::LeaseRelease => {
                RetryPolicy::constant(3, Duration::from_millis(20))
            }
            StoreOperation::ReadStatus => RetryPolicy::linear(3, Duration::from_millis(20)),
            StoreOperation::TrackQueue | StoreOperation::TrackProcessed => {
                RetryPolicy::linear(5, Duration::from_millis(20))
            }
        }
    }

    /// Whether `err` is worth another attempt for this operation.
    ///
    /// A processed watermark ahead of `enqueued_max` is retried on the
    /// assumption that a concurrent queue write is about to land. The same
    /// violation is what a caller reporting progress past anything ever
    /// enqueued produces; both cases end in `ConstraintViolation` once the
    /// budget is spent.
    pub fn is_retryable(&self, err: &Error) -> bool {
        if err.is_transient() {
            return true;
        }
        match self {
            StoreOperation::TrackQueue => err.constraint() == Some(ENQUEUED_LE_SOURCE),
            StoreOperation::TrackProcessed => {
                matches!(err, Error::JobNotFound(_))
                    || err.constraint() == Some(PROCESSED_LE_ENQUEUED)
            }
            _ => false,
        }
    }
}

/// Retry bookkeeping for one logical store operation.
///
/// Callers run an attempt, and on failure hand the error to [`Retrier::backoff`],
/// which either sleeps before the next attempt or gives the error back.
#[derive(Debug)]
pub struct Retrier {
    operation: StoreOperation,
    policy: RetryPolicy,
    retries: u32,
}

impl Retrier {
    pub fn new(operation: StoreOperation) -> Self {
        Self {
            operation,
            policy: operation.policy(),
            retries: 0,
        }
    }

    /// Number of retries performed so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Waits out the backoff if `err` is retryable and budget remains,
    /// otherwise returns `err`.
    pub async fn backoff(&mut self, err: Error) -> Result<()> {
        if !self.operation.is_retryable(&err) {
            return Err(err);
        }
        self.retries += 1;
        match self.policy.delay_before(self.retries) {
            Some(delay) => {
                tracing::warn!(
                    operation = self.operation.as_str(),
                    attempt = self.retries,
                    error = %err,
                    "Retrying store operation"
                );
                tokio::time::sleep(delay).await;
                Ok(())
            }
            None => {
                tracing::warn!(
                    operation = self.operation.as_str(),
                    attempts = self.policy.attempts,
                    error = %err,
                    "Store operation retries exhausted"
                );
                Err(err)
            }
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// operation's attempt budget is exhausted. The last error is returned.
pub async fn with_retry<T, F, Fut>(operation: StoreOperation, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retrier = Retrier::new(operation);
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => retrier.backoff(e).await?,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn constant_backoff_stops_at_budget() {
        let policy = RetryPolicy::constant(3, Duration::from_millis(20));
        assert_eq!(policy.delay_before(1), Some(Duration::from_millis(20)));
        assert_eq!(policy.delay_before(2), Some(Duration::from_millis(20)));
        assert_eq!(policy.delay_before(3), None);
    }

    #[test]
    fn linear_backoff_grows_per_retry() {
        let policy = RetryPolicy::linear(5, Duration::from_millis(20));
        assert_eq!(policy.delay_before(1), Some(Duration::from_millis(20)));
        assert_eq!(policy.delay_before(3), Some(Duration::from_millis(60)));
        assert_eq!(policy.delay_before(5), None);
    }

    #[test]
    fn retryable_sets_differ_per_operation() {
        let not_found = Error::JobNotFound("job-a".to_string());
        let processed = Error::ConstraintViolation {
            job_id: "job-a".to_string(),
            constraint: PROCESSED_LE_ENQUEUED.to_string(),
        };
        let conflict = Error::Conflict("busy".to_string());

        assert!(StoreOperation::TrackProcessed.is_retryable(&not_found));
        assert!(StoreOperation::TrackProcessed.is_retryable(&processed));
        assert!(!StoreOperation::TrackQueue.is_retryable(&processed));
        assert!(!StoreOperation::LeaseRenew.is_retryable(&not_found));
        assert!(StoreOperation::LeaseAcquire.is_retryable(&conflict));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(StoreOperation::LeaseAcquire, move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Conflict("busy".to_string()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_when_exhausted() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = with_retry(StoreOperation::LeaseRelease, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::Conflict("busy".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::Conflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_definite_failures() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<()> = with_retry(StoreOperation::TrackQueue, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::JobNotFound("job-a".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::JobNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
