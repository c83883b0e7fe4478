use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::check_lease_duration;
use crate::error::Result;
use crate::lease::{
    decide_acquire, decide_release, decide_renew, AcquireOutcome, LeaseRecord, LeaseRow,
    LeaseStore, LeaseTicket, ReleaseOutcome, RenewOutcome,
};

/// Process-local lease table. Every operation holds the table lock for its
/// whole read-decide-write cycle, which gives the same linearizability the
/// SQL store gets from its transactions.
pub struct MemoryLeaseStore {
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<String, LeaseRow>>,
}

impl MemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        id: &str,
        duration: Duration,
        if_unacquired_for: Option<Duration>,
    ) -> Result<AcquireOutcome> {
        check_lease_duration(duration)?;
        let mut leases = self.leases.lock().await;
        let now = self.clock.now();
        let transition = decide_acquire(id, leases.get(id), now, duration, if_unacquired_for);
        if let Some(row) = transition.write {
            leases.insert(id.to_string(), row);
        }
        Ok(transition.outcome)
    }

    async fn try_renew(&self, ticket: &LeaseTicket, duration: Duration) -> Result<RenewOutcome> {
        check_lease_duration(duration)?;
        let mut leases = self.leases.lock().await;
        let now = self.clock.now();
        let transition = decide_renew(ticket, leases.get(&ticket.lease_id), now, duration);
        if let Some(row) = transition.write {
            leases.insert(ticket.lease_id.clone(), row);
        }
        Ok(transition.outcome)
    }

    async fn release(&self, ticket: &LeaseTicket) -> Result<ReleaseOutcome> {
        let mut leases = self.leases.lock().await;
        let now = self.clock.now();
        let transition = decide_release(ticket, leases.get(&ticket.lease_id), now);
        if let Some(row) = transition.write {
            leases.insert(ticket.lease_id.clone(), row);
        }
        Ok(transition.outcome)
    }

    async fn describe(&self, id: &str) -> Result<Option<LeaseRecord>> {
        let leases = self.leases.lock().await;
        let now = self.clock.now();
        Ok(leases.get(id).map(|row| row.record(id, now)))
    }
}
