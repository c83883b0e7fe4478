
use std::sync::Arc;
use std::time::Duration;

use registry_importer::clock::{Clock, ManualClock};
use registry_importer::config::LeaseConfig;
use registry_importer::error::Error;
use registry_importer::lease::{
    LeaseAcquisition, LeaseCondition, LeaseManager, LeaseStore, MemoryLeaseStore,
};
use test_harness::{epoch, lease_config};

fn manager(clock: Arc<ManualClock>) -> LeaseManager {
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new(clock.clone()));
    LeaseManager::new(store, clock, lease_config()).unwrap()
}

#[tokio::test]
async fn test_second_acquirer_sees_holder() {
    let clock = Arc::new(ManualClock::new(epoch()));
    let manager = manager(clock.clone());

    let lease = manager
        .acquire_lease("cleanup", None, None)
        .await
        .unwrap()
        .into_lease()
        .unwrap();
    assert_eq!(lease.name(), "cleanup");

    match manager.acquire_lease("cleanup", None, None).await.unwrap() {
        LeaseAcquisition::Unavailable {
            acquired_at,
            expires,
        } => {
            assert_eq!(acquired_at, Some(epoch()));
            assert_eq!(expires, lease.ticket().expires);
        }
        other => panic!("expected the lease to be unavailable, got {:?}", other),
    }

    lease.dispose().await;
}

#[tokio::test]
async fn test_not_released_within_condition() {
    let clock = Arc::new(ManualClock::new(epoch()));
    let manager = manager(clock.clone());
    let condition = Some(LeaseCondition::NotReleasedWithin(Duration::from_secs(15 * 60)));

    let lease = manager
        .acquire_lease("nightly", condition, None)
        .await
        .unwrap()
        .into_lease()
        .unwrap();
    clock.advance(Duration::from_secs(20));
    lease.dispose().await;

    clock.advance(Duration::from_secs(60));
    let acquisition = manager.acquire_lease("nightly", condition, None).await.unwrap();
    assert!(!acquisition.is_acquired());
    match acquisition {
        LeaseAcquisition::ConditionUnmet { released_at, .. } => {
            assert_eq!(released_at, clock.now() - chrono::Duration::seconds(60));
        }
        other => panic!("expected condition to be unmet, got {:?}", other),
    }

    clock.advance(Duration::from_secs(15 * 60));
    let acquisition = manager.acquire_lease("nightly", condition, None).await.unwrap();
    assert!(acquisition.is_acquired());
    if let Some(lease) = acquisition.into_lease() {
        lease.dispose().await;
    }
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let clock = Arc::new(ManualClock::new(epoch()));
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new(clock.clone()));

    let too_short = LeaseConfig {
        duration: Duration::from_secs(10),
        ..lease_config()
    };
    assert!(matches!(
        LeaseManager::new(store.clone(), clock.clone(), too_short),
        Err(Error::InvalidLeaseDuration(_))
    ));

    let margin_too_wide = LeaseConfig {
        renew_margin: Duration::from_secs(60),
        ..lease_config()
    };
    assert!(matches!(
        LeaseManager::new(store, clock, margin_too_wide),
        Err(Error::Configuration(_))
    ));
}
