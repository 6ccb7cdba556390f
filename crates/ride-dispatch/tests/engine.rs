use std::sync::Arc;
use std::time::Duration;

use ride_dispatch::{
    DispatchConfig, DispatchEngine, DispatchError, RideStatus, RideStores, Side, WorkerConfig,
};
use ride_dispatch_testing::{fixtures, wait_for_version, Fault, FlakyRideStore, StaticGeoIndex};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_worker_converges_deferred_writes() {
    let mirror = Arc::new(FlakyRideStore::in_memory());
    let stores = RideStores::new(Arc::new(ride_dispatch::MemoryRideStore::new()), mirror.clone());
    let mut config = DispatchConfig::default();
    config.backoff.base_ms = 10;
    config.backoff.cap_ms = 40;
    config.worker = WorkerConfig {
        poll_interval_ms: 10,
        batch_size: 8,
    };

    let handle = DispatchEngine::builder(stores.clone(), Arc::new(StaticGeoIndex::new()))
        .with_config(config)
        .build()
        .unwrap()
        .start();

    mirror.fail_next(Fault::Unavailable, 1);
    let (_, passenger) = fixtures::passenger();
    let (_, rider) = fixtures::rider();
    let ride = handle
        .service()
        .request_ride(&passenger, fixtures::ride_request())
        .await
        .unwrap();
    let ride = handle.service().accept_ride(ride.id, &rider).await.unwrap();

    let mirrored = wait_for_version(stores.side(Side::Rider).as_ref(), ride.id, 2, Duration::from_secs(5))
        .await
        .expect("worker converges the mirror");
    assert_eq!(mirrored.sync_key(), ride.sync_key());
    assert_eq!(mirrored.status, RideStatus::Matched);

    handle.shutdown().await;
}

#[tokio::test]
async fn manual_sweep_through_handle() {
    let stores = RideStores::in_memory();
    let handle = DispatchEngine::builder(stores, Arc::new(StaticGeoIndex::new()))
        .build()
        .unwrap()
        .start();

    let report = handle.sweeper().sweep_once(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(handle.worker().run_once().await.unwrap().claimed, 0);

    handle.shutdown().await;
}

#[test]
fn invalid_config_is_rejected_at_build() {
    let mut config = DispatchConfig::default();
    config.arbiter_max_attempts = 0;

    let result = DispatchEngine::builder(RideStores::in_memory(), Arc::new(StaticGeoIndex::new()))
        .with_config(config)
        .build();

    assert!(matches!(result, Err(DispatchError::InvalidRequest(_))));
}
