//! Named, time-bounded mutual exclusion backed by a shared store.
//!
//! A lease row is keyed by a caller-chosen name. Holding a lease means
//! knowing its current token; every successful acquire or renew rotates the
//! token, so "am I still the owner" is a single equality check done by the
//! store inside one transaction.
//!
//! # Components
//!
//! - [`LeaseStore`]: atomic acquire/renew/release against the `lease` table
//!   ([`SqliteLeaseStore`]) or process memory ([`MemoryLeaseStore`])
//! - [`OwnedLease`]: an acquired lease that renews itself and signals loss
//! - [`LeaseManager`]: front door that turns store outcomes into owned leases

pub mod manager;
pub mod memory;
pub mod owned;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::to_chrono;
use crate::error::Result;

pub use manager::{LeaseAcquisition, LeaseCondition, LeaseManager};
pub use memory::MemoryLeaseStore;
pub use owned::OwnedLease;
pub use sqlite::SqliteLeaseStore;

/// The caller's proof of ownership, valid until the token rotates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseTicket {
    pub lease_id: String,
    pub token: Uuid,
    /// Expiry as of the moment this ticket was issued.
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired {
        ticket: LeaseTicket,
        acquired_at: DateTime<Utc>,
    },
    /// The lease is free but was released too recently for the caller's condition.
    ConditionUnmet {
        acquired_at: Option<DateTime<Utc>>,
        released_at: DateTime<Utc>,
    },
    /// Someone else holds an unexpired lease.
    Unavailable {
        acquired_at: Option<DateTime<Utc>>,
        expires: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed {
        ticket: LeaseTicket,
        acquired_at: Option<DateTime<Utc>>,
    },
    WrongToken {
        acquired_at: Option<DateTime<Utc>>,
        expires: DateTime<Utc>,
    },
    NotFound,
    Expired {
        acquired_at: Option<DateTime<Utc>>,
        expires: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released {
        acquired_at: Option<DateTime<Utc>>,
        released_at: DateTime<Utc>,
    },
    WrongToken {
        acquired_at: Option<DateTime<Utc>>,
        expires: DateTime<Utc>,
    },
    NotFound,
    Expired {
        acquired_at: Option<DateTime<Utc>>,
        expires: DateTime<Utc>,
    },
}

/// Lease history without the token, for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseRecord {
    pub id: String,
    pub held: bool,
    pub expires: DateTime<Utc>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

/// Atomic lease operations. Each call runs as one store transaction and
/// retries transient conflicts; ownership conflicts are outcomes, not errors.
///
/// Durations outside `30s..=15m` fail with
/// [`Error::InvalidLeaseDuration`](crate::error::Error::InvalidLeaseDuration)
/// before the store is touched.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquires `id` if it is free. With `if_unacquired_for`, a free lease is
    /// only taken once it has been free for at least that long; a lease that
    /// was never seen is always taken.
    async fn try_acquire(
        &self,
        id: &str,
        duration: Duration,
        if_unacquired_for: Option<Duration>,
    ) -> Result<AcquireOutcome>;

    /// Extends the lease and rotates its token.
    async fn try_renew(&self, ticket: &LeaseTicket, duration: Duration) -> Result<RenewOutcome>;

    /// Clears the token and stamps the release time.
    async fn release(&self, ticket: &LeaseTicket) -> Result<ReleaseOutcome>;

    async fn describe(&self, id: &str) -> Result<Option<LeaseRecord>>;
}

/// Persisted shape of one lease.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub(crate) struct LeaseRow {
    pub token: Option<Uuid>,
    pub expires: DateTime<Utc>,
    pub acquired: Option<DateTime<Utc>>,
    pub released: Option<DateTime<Utc>>,
}

impl LeaseRow {
    fn is_held(&self, now: DateTime<Utc>) -> bool {
        self.token.is_some() && self.expires > now
    }

    /// When the lease last became free: the release stamp, or the expiry of
    /// a holder that never released.
    fn free_since(&self) -> DateTime<Utc> {
        self.released.unwrap_or(self.expires)
    }

    fn record(&self, id: &str, now: DateTime<Utc>) -> LeaseRecord {
        LeaseRecord {
            id: id.to_string(),
            held: self.is_held(now),
            expires: self.expires,
            acquired_at: self.acquired,
            released_at: self.released,
        }
    }
}

/// What a store should persist (if anything) and report back.
#[derive(Debug)]
pub(crate) struct Transition<T> {
    pub write: Option<LeaseRow>,
    pub outcome: T,
}

impl<T> Transition<T> {
    fn read_only(outcome: T) -> Self {
        Self {
            write: None,
            outcome,
        }
    }
}

pub(crate) fn decide_acquire(
    id: &str,
    row: Option<&LeaseRow>,
    now: DateTime<Utc>,
    duration: Duration,
    if_unacquired_for: Option<Duration>,
) -> Transition<AcquireOutcome> {
    if let Some(row) = row {
        if row.is_held(now) {
            return Transition::read_only(AcquireOutcome::Unavailable {
                acquired_at: row.acquired,
                expires: row.expires,
            });
        }
        if let Some(min_free) = if_unacquired_for {
            let released_at = row.free_since();
            if now - released_at < to_chrono(min_free) {
                return Transition::read_only(AcquireOutcome::ConditionUnmet {
                    acquired_at: row.acquired,
                    released_at,
                });
            }
        }
    }

    let ticket = LeaseTicket {
        lease_id: id.to_string(),
        token: Uuid::new_v4(),
        expires: now + to_chrono(duration),
    };
    Transition {
        write: Some(LeaseRow {
            token: Some(ticket.token),
            expires: ticket.expires,
            acquired: Some(now),
            released: None,
        }),
        outcome: AcquireOutcome::Acquired {
            ticket,
            acquired_at: now,
        },
    }
}

pub(crate) fn decide_renew(
    ticket: &LeaseTicket,
    row: Option<&LeaseRow>,
    now: DateTime<Utc>,
    duration: Duration,
) -> Transition<RenewOutcome> {
    let Some(row) = row else {
        return Transition::read_only(RenewOutcome::NotFound);
    };
    if row.token != Some(ticket.token) {
        return Transition::read_only(RenewOutcome::WrongToken {
            acquired_at: row.acquired,
            expires: row.expires,
        });
    }
    if row.expires <= now {
        return Transition::read_only(RenewOutcome::Expired {
            acquired_at: row.acquired,
            expires: row.expires,
        });
    }

    let renewed = LeaseTicket {
        lease_id: ticket.lease_id.clone(),
        token: Uuid::new_v4(),
        expires: now + to_chrono(duration),
    };
    Transition {
        write: Some(LeaseRow {
            token: Some(renewed.token),
            expires: renewed.expires,
            ..row.clone()
        }),
        outcome: RenewOutcome::Renewed {
            ticket: renewed,
            acquired_at: row.acquired,
        },
    }
}

pub(crate) fn decide_release(
    ticket: &LeaseTicket,
    row: Option<&LeaseRow>,
    now: DateTime<Utc>,
) -> Transition<ReleaseOutcome> {
    let Some(row) = row else {
        return Transition::read_only(ReleaseOutcome::NotFound);
    };
    if row.token != Some(ticket.token) {
        return Transition::read_only(ReleaseOutcome::WrongToken {
            acquired_at: row.acquired,
            expires: row.expires,
        });
    }
    if row.expires <= now {
        return Transition::read_only(ReleaseOutcome::Expired {
            acquired_at: row.acquired,
            expires: row.expires,
        });
    }

    Transition {
        write: Some(LeaseRow {
            token: None,
            released: Some(now),
            ..row.clone()
        }),
        outcome: ReleaseOutcome::Released {
            acquired_at: row.acquired,
            released_at: now,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn secs(n: i64) -> chrono::Duration {
        chrono::Duration::seconds(n)
    }

    const MINUTE: Duration = Duration::from_secs(60);

    fn acquired(id: &str, now: DateTime<Utc>) -> (LeaseTicket, LeaseRow) {
        let t = decide_acquire(id, None, now, MINUTE, None);
        match t.outcome {
            AcquireOutcome::Acquired { ticket, .. } => (ticket, t.write.unwrap()),
            other => panic!("expected acquisition, got {other:?}"),
        }
    }

    #[test]
    fn first_acquire_creates_row_even_with_condition() {
        let t = decide_acquire("cleanup", None, t0(), MINUTE, Some(Duration::from_secs(900)));
        let row = t.write.expect("row should be created");
        assert_eq!(row.acquired, Some(t0()));
        assert_eq!(row.expires, t0() + secs(60));
        assert!(row.released.is_none());
        assert!(matches!(t.outcome, AcquireOutcome::Acquired { .. }));
    }

    #[test]
    fn held_lease_is_unavailable() {
        let (_, row) = acquired("cleanup", t0());
        let t = decide_acquire("cleanup", Some(&row), t0() + secs(30), MINUTE, None);
        assert!(t.write.is_none());
        assert_eq!(
            t.outcome,
            AcquireOutcome::Unavailable {
                acquired_at: Some(t0()),
                expires: t0() + secs(60),
            }
        );
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let (ticket, row) = acquired("cleanup", t0());
        let t = decide_acquire("cleanup", Some(&row), t0() + secs(60), MINUTE, None);
        match t.outcome {
            AcquireOutcome::Acquired { ticket: next, .. } => assert_ne!(next.token, ticket.token),
            other => panic!("expected acquisition, got {other:?}"),
        }
    }

    #[test]
    fn condition_uses_release_time() {
        let (ticket, row) = acquired("cleanup", t0());
        let released = decide_release(&ticket, Some(&row), t0() + secs(10))
            .write
            .unwrap();

        let too_soon = decide_acquire(
            "cleanup",
            Some(&released),
            t0() + secs(100),
            MINUTE,
            Some(Duration::from_secs(900)),
        );
        assert!(too_soon.write.is_none());
        assert_eq!(
            too_soon.outcome,
            AcquireOutcome::ConditionUnmet {
                acquired_at: Some(t0()),
                released_at: t0() + secs(10),
            }
        );

        let later = decide_acquire(
            "cleanup",
            Some(&released),
            t0() + secs(910),
            MINUTE,
            Some(Duration::from_secs(900)),
        );
        assert!(matches!(later.outcome, AcquireOutcome::Acquired { .. }));
    }

    #[test]
    fn condition_falls_back_to_expiry_when_never_released() {
        let (_, row) = acquired("cleanup", t0());
        let t = decide_acquire(
            "cleanup",
            Some(&row),
            t0() + secs(61),
            MINUTE,
            Some(Duration::from_secs(120)),
        );
        assert_eq!(
            t.outcome,
            AcquireOutcome::ConditionUnmet {
                acquired_at: Some(t0()),
                released_at: t0() + secs(60),
            }
        );
    }

    #[test]
    fn renew_rotates_token_and_keeps_acquired_at() {
        let (ticket, row) = acquired("cleanup", t0());
        let t = decide_renew(&ticket, Some(&row), t0() + secs(55), MINUTE);
        let written = t.write.unwrap();
        match t.outcome {
            RenewOutcome::Renewed {
                ticket: next,
                acquired_at,
            } => {
                assert_ne!(next.token, ticket.token);
                assert_eq!(next.expires, t0() + secs(115));
                assert_eq!(acquired_at, Some(t0()));
                assert_eq!(written.token, Some(next.token));
            }
            other => panic!("expected renewal, got {other:?}"),
        }
    }

    #[test]
    fn renew_rejects_stale_token_missing_row_and_expiry() {
        let (ticket, row) = acquired("cleanup", t0());
        let stale = LeaseTicket {
            token: Uuid::new_v4(),
            ..ticket.clone()
        };

        assert!(matches!(
            decide_renew(&stale, Some(&row), t0(), MINUTE).outcome,
            RenewOutcome::WrongToken { .. }
        ));
        assert_eq!(
            decide_renew(&ticket, None, t0(), MINUTE).outcome,
            RenewOutcome::NotFound
        );
        assert!(matches!(
            decide_renew(&ticket, Some(&row), t0() + secs(60), MINUTE).outcome,
            RenewOutcome::Expired { .. }
        ));
    }

    #[test]
    fn release_clears_token_and_stamps_time() {
        let (ticket, row) = acquired("cleanup", t0());
        let t = decide_release(&ticket, Some(&row), t0() + secs(5));
        let written = t.write.unwrap();
        assert!(written.token.is_none());
        assert_eq!(written.released, Some(t0() + secs(5)));
        assert!(!written.is_held(t0() + secs(5)));

        let again = decide_release(&ticket, Some(&written), t0() + secs(6));
        assert!(again.write.is_none());
        assert!(matches!(again.outcome, ReleaseOutcome::WrongToken { .. }));
    }
}
