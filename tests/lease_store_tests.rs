//! Integration tests for the SQLite lease store.
//!
//! Verifies that:
//! - Acquire, renew and release follow the ownership rules
//! - Every successful acquire or renew rotates the token
//! - Concurrent acquirers never both win
//! - Release history gates conditional acquisition


use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use registry_importer::clock::{Clock, ManualClock};
use registry_importer::error::Error;
use registry_importer::lease::{
    AcquireOutcome, LeaseStore, LeaseTicket, ReleaseOutcome, RenewOutcome, SqliteLeaseStore,
};
use test_harness::{epoch, temp_pool};

const MINUTE: Duration = Duration::from_secs(60);

fn acquired(outcome: AcquireOutcome) -> LeaseTicket {
    match outcome {
        AcquireOutcome::Acquired { ticket, .. } => ticket,
        other => panic!("expected lease to be acquired, got {:?}", other),
    }
}

async fn store_at_epoch() -> (tempfile::TempDir, Arc<ManualClock>, SqliteLeaseStore) {
    let (dir, pool) = temp_pool().await;
    let clock = Arc::new(ManualClock::new(epoch()));
    let store = SqliteLeaseStore::new(pool, clock.clone());
    (dir, clock, store)
}

#[tokio::test]
async fn test_acquire_renew_and_contend() {
    let (_dir, clock, store) = store_at_epoch().await;
    let t0 = epoch();

    let first = acquired(store.try_acquire("cleanup", MINUTE, None).await.unwrap());
    assert_eq!(first.expires, t0 + ChronoDuration::seconds(60));

    clock.advance(Duration::from_secs(55));
    let second = match store.try_renew(&first, MINUTE).await.unwrap() {
        RenewOutcome::Renewed { ticket, acquired_at } => {
            assert_eq!(acquired_at, Some(t0));
            ticket
        }
        other => panic!("expected renewal, got {:?}", other),
    };
    assert_ne!(second.token, first.token, "renewal must rotate the token");
    assert_eq!(second.expires, t0 + ChronoDuration::seconds(115));

    clock.advance(Duration::from_secs(5));
    assert_eq!(
        store.try_acquire("cleanup", MINUTE, None).await.unwrap(),
        AcquireOutcome::Unavailable {
            acquired_at: Some(t0),
            expires: t0 + ChronoDuration::seconds(115),
        }
    );
}

#[tokio::test]
async fn test_stale_ticket_gets_wrong_token() {
    let (_dir, _clock, store) = store_at_epoch().await;

    let first = acquired(store.try_acquire("cleanup", MINUTE, None).await.unwrap());
    let RenewOutcome::Renewed { .. } = store.try_renew(&first, MINUTE).await.unwrap() else {
        panic!("first renewal should succeed");
    };

    assert!(matches!(
        store.try_renew(&first, MINUTE).await.unwrap(),
        RenewOutcome::WrongToken { .. }
    ));
    assert!(matches!(
        store.release(&first).await.unwrap(),
        ReleaseOutcome::WrongToken { .. }
    ));
}

#[tokio::test]
async fn test_renew_after_expiry_and_unknown_lease() {
    let (_dir, clock, store) = store_at_epoch().await;

    let ticket = acquired(store.try_acquire("cleanup", MINUTE, None).await.unwrap());
    clock.advance(Duration::from_secs(61));
    assert!(matches!(
        store.try_renew(&ticket, MINUTE).await.unwrap(),
        RenewOutcome::Expired { .. }
    ));

    let unknown = LeaseTicket {
        lease_id: "never-acquired".to_string(),
        ..ticket
    };
    assert_eq!(
        store.try_renew(&unknown, MINUTE).await.unwrap(),
        RenewOutcome::NotFound
    );
    assert_eq!(store.release(&unknown).await.unwrap(), ReleaseOutcome::NotFound);
}

#[tokio::test]
async fn test_release_frees_lease_and_keeps_history() {
    let (_dir, clock, store) = store_at_epoch().await;
    let t0 = epoch();

    let ticket = acquired(store.try_acquire("cleanup", MINUTE, None).await.unwrap());
    clock.advance(Duration::from_secs(10));
    assert_eq!(
        store.release(&ticket).await.unwrap(),
        ReleaseOutcome::Released {
            acquired_at: Some(t0),
            released_at: t0 + ChronoDuration::seconds(10),
        }
    );

    let record = store.describe("cleanup").await.unwrap().unwrap();
    assert!(!record.held);
    assert_eq!(record.acquired_at, Some(t0));
    assert_eq!(record.released_at, Some(t0 + ChronoDuration::seconds(10)));

    // Free again, so anyone may take it.
    acquired(store.try_acquire("cleanup", MINUTE, None).await.unwrap());
    assert!(store.describe("cleanup").await.unwrap().unwrap().held);
    assert!(store.describe("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_conditional_acquire_honours_release_history() {
    let (_dir, clock, store) = store_at_epoch().await;
    let window = Some(Duration::from_secs(15 * 60));

    // A lease nobody has seen is always acquirable.
    let ticket = acquired(store.try_acquire("report", MINUTE, window).await.unwrap());
    clock.advance(Duration::from_secs(30));
    store.release(&ticket).await.unwrap();
    let released_at = clock.now();

    clock.advance(Duration::from_secs(5 * 60));
    match store.try_acquire("report", MINUTE, window).await.unwrap() {
        AcquireOutcome::ConditionUnmet {
            released_at: reported,
            ..
        } => assert_eq!(reported, released_at),
        other => panic!("expected condition to be unmet, got {:?}", other),
    }

    clock.advance(Duration::from_secs(10 * 60));
    acquired(store.try_acquire("report", MINUTE, window).await.unwrap());
}

#[tokio::test]
async fn test_expired_lease_counts_as_released_at_expiry() {
    let (_dir, clock, store) = store_at_epoch().await;
    let window = Some(Duration::from_secs(10 * 60));

    let ticket = acquired(store.try_acquire("report", MINUTE, None).await.unwrap());
    clock.advance(Duration::from_secs(120));

    match store.try_acquire("report", MINUTE, window).await.unwrap() {
        AcquireOutcome::ConditionUnmet { released_at, .. } => {
            assert_eq!(released_at, ticket.expires)
        }
        other => panic!("expected condition to be unmet, got {:?}", other),
    }
}

#[tokio::test]
async fn test_duration_bounds_fail_fast() {
    let (_dir, _clock, store) = store_at_epoch().await;

    let err = store
        .try_acquire("cleanup", Duration::from_secs(10), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidLeaseDuration(_)));

    let err = store
        .try_acquire("cleanup", Duration::from_secs(16 * 60), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidLeaseDuration(_)));

    // Nothing was written.
    assert!(store.describe("cleanup").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_single_winner() {
    let (_dir, _clock, store) = store_at_epoch().await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.try_acquire("singleton", MINUTE, None).await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(AcquireOutcome::Acquired { .. }) => winners += 1,
            Ok(AcquireOutcome::Unavailable { .. }) => {}
            Ok(other) => panic!("unexpected outcome {:?}", other),
            // Contention past the retry budget is a definite failure, not a win.
            Err(e) => assert!(e.is_transient(), "unexpected error {}", e),
        }
    }
    assert_eq!(winners, 1, "exactly one acquirer must win");
}
