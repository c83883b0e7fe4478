use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::{to_chrono, until, Clock};
use crate::config::LeaseConfig;
use crate::lease::{LeaseStore, LeaseTicket, ReleaseOutcome, RenewOutcome};

/// How long to wait before renewing a ticket that expires at `expires`.
pub fn renew_delay(now: DateTime<Utc>, expires: DateTime<Utc>, margin: Duration) -> Duration {
    until(now, expires - to_chrono(margin))
}

struct Shared {
    name: String,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
    ticket: watch::Sender<LeaseTicket>,
    lost: AtomicBool,
    /// Fires when the lease is lost or the caller's token is cancelled.
    cancelled: CancellationToken,
    /// Fires on disposal or drop; stops renewal without marking the lease cancelled.
    stop: CancellationToken,
}

impl Shared {
    fn current(&self) -> LeaseTicket {
        self.ticket.borrow().clone()
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
        self.cancelled.cancel();
    }

    /// Waits `delay` unless renewal should stop first. Returns false if it should.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = self.cancelled.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// An acquired lease that keeps itself alive.
///
/// A background task renews the lease `renew_margin` before each expiry and
/// rotates the held ticket. If a renewal reports that someone else owns the
/// lease (wrong token, missing row or expiry), renewal stops and the
/// cancellation token fires. The token also fires when the caller's external
/// token, if any, is cancelled.
///
/// Call [`dispose`](Self::dispose) to stop renewing and release the lease.
/// Dropping without disposing stops renewal and lets the lease expire.
pub struct OwnedLease {
    shared: Arc<Shared>,
    acquired_at: DateTime<Utc>,
    renewal: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl OwnedLease {
    pub(crate) fn start(
        ticket: LeaseTicket,
        acquired_at: DateTime<Utc>,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
        external: Option<&CancellationToken>,
    ) -> Self {
        let cancelled = match external {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        };
        let (ticket_tx, _) = watch::channel(ticket.clone());
        let shared = Arc::new(Shared {
            name: ticket.lease_id,
            store,
            clock,
            config,
            ticket: ticket_tx,
            lost: AtomicBool::new(false),
            cancelled,
            stop: CancellationToken::new(),
        });

        let renewal = tokio::spawn(renew_loop(shared.clone()));

        Self {
            shared,
            acquired_at,
            renewal: Mutex::new(Some(renewal)),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Snapshot of the ticket currently held.
    pub fn ticket(&self) -> LeaseTicket {
        self.shared.current()
    }

    /// True once a renewal found the lease owned by someone else.
    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::Acquire)
    }

    /// True once the lease was lost or the caller's token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.is_cancelled()
    }

    /// The combined loss/external cancellation signal.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancelled.clone()
    }

    pub async fn cancelled(&self) {
        self.shared.cancelled.cancelled().await
    }

    /// Stops renewal and releases the lease unless it was lost or cancelled.
    ///
    /// Safe to call any number of times from any number of tasks; only the
    /// first call tears down. Release failures are logged and swallowed.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.shared.stop.cancel();
        let renewal = self.renewal.lock().await.take();
        if let Some(handle) = renewal {
            if let Err(e) = handle.await {
                tracing::warn!(lease = %self.shared.name, error = %e, "Lease renewal task failed");
            }
        }

        if self.shared.cancelled.is_cancelled() {
            tracing::debug!(
                lease = %self.shared.name,
                lost = self.is_lost(),
                "Skipping release of cancelled lease"
            );
            return;
        }

        let ticket = self.shared.current();
        match self.shared.store.release(&ticket).await {
            Ok(ReleaseOutcome::Released { released_at, .. }) => {
                tracing::debug!(lease = %self.shared.name, released_at = %released_at, "Lease released");
            }
            Ok(outcome) => {
                tracing::debug!(lease = %self.shared.name, ?outcome, "Lease was no longer ours to release");
            }
            Err(e) => {
                tracing::warn!(lease = %self.shared.name, error = %e, "Failed to release lease");
            }
        }
    }
}

impl Drop for OwnedLease {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

impl std::fmt::Debug for OwnedLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedLease")
            .field("name", &self.shared.name)
            .field("acquired_at", &self.acquired_at)
            .field("expires", &self.shared.current().expires)
            .field("lost", &self.is_lost())
            .finish()
    }
}

async fn renew_loop(shared: Arc<Shared>) {
    let margin = shared.config.renew_margin;
    let mut delay = renew_delay(shared.clock.now(), shared.current().expires, margin);

    loop {
        if !shared.pause(delay).await {
            break;
        }

        let ticket = shared.current();
        match shared.store.try_renew(&ticket, shared.config.duration).await {
            Ok(RenewOutcome::Renewed { ticket, .. }) => {
                tracing::debug!(lease = %shared.name, expires = %ticket.expires, "Lease renewed");
                delay = renew_delay(shared.clock.now(), ticket.expires, margin);
                shared.ticket.send_replace(ticket);
            }
            Ok(outcome) => {
                tracing::warn!(lease = %shared.name, ?outcome, "Lease lost");
                shared.mark_lost();
                break;
            }
            Err(e) => {
                if shared.clock.now() >= ticket.expires {
                    tracing::warn!(
                        lease = %shared.name,
                        error = %e,
                        "Lease expired while renewal was failing"
                    );
                    shared.mark_lost();
                    break;
                }
                tracing::warn!(lease = %shared.name, error = %e, "Lease renewal failed, retrying");
                delay = shared.config.renew_retry_delay;
            }
        }
    }

    tracing::trace!(lease = %shared.name, "Lease renewal stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn renew_fires_one_margin_before_expiry() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let expires = now + chrono::Duration::seconds(60);
        assert_eq!(
            renew_delay(now, expires, Duration::from_secs(20)),
            Duration::from_secs(40)
        );
    }

    #[test]
    fn renew_is_immediate_inside_the_margin() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let expires = now + chrono::Duration::seconds(5);
        assert_eq!(
            renew_delay(now, expires, Duration::from_secs(20)),
            Duration::ZERO
        );
    }
}
