use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::LeaseConfig;
use crate::error::Result;
use crate::lease::{AcquireOutcome, LeaseStore, OwnedLease};

/// Condition on the lease's history that must hold for acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseCondition {
    /// Only acquire if nobody has released the lease within this window,
    /// e.g. "only run if it has not run in the last 15 minutes".
    NotReleasedWithin(Duration),
}

impl LeaseCondition {
    fn unacquired_for(&self) -> Duration {
        match self {
            LeaseCondition::NotReleasedWithin(window) => *window,
        }
    }
}

/// Result of [`LeaseManager::acquire_lease`].
#[derive(Debug)]
pub enum LeaseAcquisition {
    Acquired(OwnedLease),
    /// Free, but released more recently than the condition allows.
    ConditionUnmet {
        acquired_at: Option<DateTime<Utc>>,
        released_at: DateTime<Utc>,
    },
    /// Held by someone else until `expires`.
    Unavailable {
        acquired_at: Option<DateTime<Utc>>,
        expires: DateTime<Utc>,
    },
}

impl LeaseAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LeaseAcquisition::Acquired(_))
    }

    pub fn into_lease(self) -> Option<OwnedLease> {
        match self {
            LeaseAcquisition::Acquired(lease) => Some(lease),
            _ => None,
        }
    }
}

/// Hands out self-renewing leases of a fixed duration.
pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, config: LeaseConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Makes one acquisition attempt for `name`.
    ///
    /// On success the returned lease renews itself until disposed, lost, or
    /// until `cancel` fires. Otherwise the last known lease history is
    /// returned so callers can decide when to try again.
    pub async fn acquire_lease(
        &self,
        name: &str,
        condition: Option<LeaseCondition>,
        cancel: Option<&CancellationToken>,
    ) -> Result<LeaseAcquisition> {
        let outcome = self
            .store
            .try_acquire(
                name,
                self.config.duration,
                condition.map(|c| c.unacquired_for()),
            )
            .await?;

        Ok(match outcome {
            AcquireOutcome::Acquired {
                ticket,
                acquired_at,
            } => {
                tracing::info!(lease = name, expires = %ticket.expires, "Lease acquired");
                LeaseAcquisition::Acquired(OwnedLease::start(
                    ticket,
                    acquired_at,
                    self.store.clone(),
                    self.clock.clone(),
                    self.config.clone(),
                    cancel,
                ))
            }
            AcquireOutcome::ConditionUnmet {
                acquired_at,
                released_at,
            } => {
                tracing::debug!(lease = name, released_at = %released_at, "Lease released too recently");
                LeaseAcquisition::ConditionUnmet {
                    acquired_at,
                    released_at,
                }
            }
            AcquireOutcome::Unavailable {
                acquired_at,
                expires,
            } => {
                tracing::debug!(lease = name, expires = %expires, "Lease held elsewhere");
                LeaseAcquisition::Unavailable {
                    acquired_at,
                    expires,
                }
            }
        })
    }
}
