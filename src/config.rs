use std::time::Duration;

use crate::error::{Error, Result};

/// Shortest lease a caller may request.
pub const MIN_LEASE_DURATION: Duration = Duration::from_secs(30);
/// Longest lease a caller may request.
pub const MAX_LEASE_DURATION: Duration = Duration::from_secs(15 * 60);

/// Fails fast when a lease duration is outside `MIN_LEASE_DURATION..=MAX_LEASE_DURATION`.
pub fn check_lease_duration(duration: Duration) -> Result<()> {
    if (MIN_LEASE_DURATION..=MAX_LEASE_DURATION).contains(&duration) {
        Ok(())
    } else {
        Err(Error::InvalidLeaseDuration(duration))
    }
}

/// Lease acquisition and renewal settings.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Duration requested on every acquire and renew.
    pub duration: Duration,
    /// How long before expiry the renewal fires.
    pub renew_margin: Duration,
    /// Delay before retrying a renewal that failed with a store error.
    pub renew_retry_delay: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            renew_margin: Duration::from_secs(20),
            renew_retry_delay: Duration::from_secs(1),
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<()> {
        check_lease_duration(self.duration)?;
        if self.renew_margin >= self.duration {
            return Err(Error::Configuration(format!(
                "renew margin {:?} must be shorter than the lease duration {:?}",
                self.renew_margin, self.duration
            )));
        }
        Ok(())
    }
}

/// Progress tracker worker settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// The worker returns its connection to the pool after this much inactivity.
    pub idle_connection_timeout: Duration,
    /// Bound of the request queue feeding the worker.
    pub queue_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            idle_connection_timeout: Duration::from_secs(1),
            queue_capacity: 1024,
        }
    }
}

/// Job scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound of the random delay added to leased scheduled runs so
    /// instances do not all race for the lease at the same instant.
    pub jitter: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jitter: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub database_url: String,
    pub lease: LeaseConfig,
    pub tracker: TrackerConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://registry.db".to_string(),
            lease: LeaseConfig::default(),
            tracker: TrackerConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl HostConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_tracker(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
}
