use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::clock::{to_chrono, until};

/// Generates a random jitter in `0..=max`.
pub fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=max_ms))
}

/// What the next run of a scheduled job is anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAnchor {
    /// This instance just finished a run (or skipped one).
    Completed,
    /// Another instance released the job's lease at this time.
    ReleasedAt(DateTime<Utc>),
    /// Another instance holds the job's lease until this time.
    HeldUntil(DateTime<Utc>),
}

/// Delay until the next tick of a job that runs every `interval`.
pub fn next_run_delay(
    now: DateTime<Utc>,
    anchor: ScheduleAnchor,
    interval: Duration,
    jitter: Duration,
) -> Duration {
    let base = match anchor {
        ScheduleAnchor::Completed => interval,
        ScheduleAnchor::ReleasedAt(released) => until(now, released + to_chrono(interval)),
        ScheduleAnchor::HeldUntil(expires) => interval.min(until(now, expires)),
    };
    base.saturating_add(jitter)
}
