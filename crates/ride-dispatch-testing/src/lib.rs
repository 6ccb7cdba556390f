//! Testing utilities for ride-dispatch.
//!
//! - [`FlakyRideStore`]: wraps a store and injects failures on demand
//! - [`StaticGeoIndex`]: an in-memory [`GeoIndex`] with straight-line distances
//! - [`TestDispatch`]: a fully wired service with no background tasks, so
//!   tests drive the worker and sweeper by hand
//! - [`fixtures`]: ride requests and callers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ride_dispatch::{
    DispatchConfig, DispatchService, EventBus, GeoIndex, GeoPoint, MemoryPropagationQueue,
    MemoryRideStore, Nearby, ReconciliationSweeper, Ride, RideId, RidePatch, RideStore,
    RideStores, RiderId, ScanCursor, Side, StoreError, Synchronizer, SyncWorker, UpdateOutcome,
};

/// Kind of failure a [`FlakyRideStore`] injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Transient; the synchronizer retries it.
    Unavailable,
    /// Transient; reported as an elapsed budget.
    Timeout,
    /// Permanent; dead-lettered on first sight.
    Backend,
}

impl Fault {
    fn into_error(self) -> StoreError {
        match self {
            Fault::Unavailable => StoreError::Unavailable("injected fault".into()),
            Fault::Timeout => StoreError::Timeout { millis: 0 },
            Fault::Backend => StoreError::Backend(anyhow::anyhow!("injected fault")),
        }
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    /// Failing until cleared.
    outage: Option<Fault>,
    /// Failing for the next N calls.
    burst: Option<(Fault, u32)>,
}

/// A [`RideStore`] that fails when told to.
///
/// Every trait call consults the fault plan first; a call that fails never
/// reaches the inner store.
pub struct FlakyRideStore {
    inner: Arc<dyn RideStore>,
    plan: Mutex<FaultPlan>,
    calls: AtomicU64,
    failures: AtomicU64,
}

impl FlakyRideStore {
    pub fn new(inner: Arc<dyn RideStore>) -> Self {
        Self {
            inner,
            plan: Mutex::new(FaultPlan::default()),
            calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRideStore::new()))
    }

    /// Fail the next `calls` calls with `fault`.
    pub fn fail_next(&self, fault: Fault, calls: u32) {
        self.plan().burst = Some((fault, calls));
    }

    /// Fail every call with `fault` until [`recover`](Self::recover).
    pub fn outage(&self, fault: Fault) {
        self.plan().outage = Some(fault);
    }

    /// Clear all injected faults.
    pub fn recover(&self) {
        *self.plan() = FaultPlan::default();
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn injected_failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    fn plan(&self) -> std::sync::MutexGuard<'_, FaultPlan> {
        self.plan.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut plan = self.plan();

        let fault = if let Some(fault) = plan.outage {
            Some(fault)
        } else if let Some((fault, remaining)) = plan.burst {
            plan.burst = (remaining > 1).then_some((fault, remaining - 1));
            (remaining > 0).then_some(fault)
        } else {
            None
        };

        match fault {
            Some(fault) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                Err(fault.into_error())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RideStore for FlakyRideStore {
    async fn get(&self, id: RideId) -> Result<Option<Ride>, StoreError> {
        self.check()?;
        self.inner.get(id).await
    }

    async fn create(&self, ride: &Ride) -> Result<Ride, StoreError> {
        self.check()?;
        self.inner.create(ride).await
    }

    async fn conditional_update(
        &self,
        id: RideId,
        expected_version: u64,
        patch: &RidePatch,
    ) -> Result<UpdateOutcome, StoreError> {
        self.check()?;
        self.inner.conditional_update(id, expected_version, patch).await
    }

    async fn origins_touched_since(
        &self,
        origin_side: Side,
        since: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> Result<Vec<Ride>, StoreError> {
        self.check()?;
        self.inner
            .origins_touched_since(origin_side, since, after, limit)
            .await
    }
}

/// In-memory geospatial index.
///
/// Distances are equirectangular approximations, which is plenty for
/// city-scale fixtures.
#[derive(Debug, Default)]
pub struct StaticGeoIndex {
    rides: DashMap<RideId, GeoPoint>,
    riders: DashMap<RiderId, GeoPoint>,
}

impl StaticGeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a ride's pickup point.
    pub fn add_ride(&self, ride_id: RideId, pickup: GeoPoint) {
        self.rides.insert(ride_id, pickup);
    }

    pub fn remove_ride(&self, ride_id: RideId) {
        self.rides.remove(&ride_id);
    }

    /// Mark a rider online at `point`.
    pub fn rider_online(&self, rider_id: RiderId, point: GeoPoint) {
        self.riders.insert(rider_id, point);
    }

    pub fn rider_offline(&self, rider_id: RiderId) {
        self.riders.remove(&rider_id);
    }
}

#[async_trait]
impl GeoIndex for StaticGeoIndex {
    async fn nearby_rides(
        &self,
        point: GeoPoint,
        radius_m: f64,
    ) -> anyhow::Result<Vec<Nearby<RideId>>> {
        Ok(self
            .rides
            .iter()
            .map(|entry| Nearby {
                id: *entry.key(),
                distance_m: distance_m(point, *entry.value()),
            })
            .filter(|hit| hit.distance_m <= radius_m)
            .collect())
    }

    async fn nearby_riders(
        &self,
        point: GeoPoint,
        radius_m: f64,
    ) -> anyhow::Result<Vec<Nearby<RiderId>>> {
        Ok(self
            .riders
            .iter()
            .map(|entry| Nearby {
                id: *entry.key(),
                distance_m: distance_m(point, *entry.value()),
            })
            .filter(|hit| hit.distance_m <= radius_m)
            .collect())
    }

    async fn rider_location(&self, rider_id: RiderId) -> anyhow::Result<Option<GeoPoint>> {
        Ok(self.riders.get(&rider_id).map(|point| *point))
    }
}

fn distance_m(a: GeoPoint, b: GeoPoint) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;
    let mean_lat = ((a.lat + b.lat) / 2.0).to_radians();
    let x = (b.lng - a.lng).to_radians() * mean_lat.cos();
    let y = (b.lat - a.lat).to_radians();
    (x * x + y * y).sqrt() * EARTH_RADIUS_M
}

/// A dispatch service wired to in-memory stores, a fault-injectable
/// mirror, and an in-memory queue.
///
/// Rides originate on the passenger side, so `mirror` is the rider-side
/// store. Nothing runs in the background except the inline propagation
/// task spawned per write.
pub struct TestDispatch {
    pub service: DispatchService,
    pub stores: RideStores,
    pub origin: Arc<MemoryRideStore>,
    pub mirror: Arc<FlakyRideStore>,
    pub geo: Arc<StaticGeoIndex>,
    pub queue: Arc<MemoryPropagationQueue>,
    pub sync: Arc<Synchronizer>,
    pub worker: SyncWorker,
    pub sweeper: ReconciliationSweeper,
    pub bus: EventBus,
}

impl TestDispatch {
    pub fn new() -> Self {
        Self::with_config(DispatchConfig::default())
    }

    /// `config.origin_side` is forced to [`Side::Passenger`].
    pub fn with_config(mut config: DispatchConfig) -> Self {
        config.origin_side = Side::Passenger;

        let origin = Arc::new(MemoryRideStore::new());
        let mirror = Arc::new(FlakyRideStore::in_memory());
        let stores = RideStores::new(origin.clone(), mirror.clone());
        let geo = Arc::new(StaticGeoIndex::new());
        let queue = Arc::new(MemoryPropagationQueue::new(config.backoff));
        let bus = EventBus::new();

        let sync = Arc::new(Synchronizer::new(
            stores.clone(),
            queue.clone(),
            bus.clone(),
            config.backoff,
            config.store_timeout(),
        ));
        let worker = SyncWorker::new(Arc::clone(&sync), config.worker.clone());
        let sweeper = ReconciliationSweeper::new(
            stores.clone(),
            Arc::clone(&sync),
            config.sweeper.clone(),
            config.store_timeout(),
        );
        let service = DispatchService::new(
            stores.clone(),
            geo.clone(),
            Arc::clone(&sync),
            bus.clone(),
            config,
        );

        Self {
            service,
            stores,
            origin,
            mirror,
            geo,
            queue,
            sync,
            worker,
            sweeper,
            bus,
        }
    }

    /// Poll the mirror until it reaches `version` or `timeout` elapses.
    pub async fn wait_for_mirror(
        &self,
        ride_id: RideId,
        version: u64,
        timeout: Duration,
    ) -> Option<Ride> {
        wait_for_version(self.stores.side(Side::Rider).as_ref(), ride_id, version, timeout).await
    }
}

impl Default for TestDispatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `store` until `ride_id` is at `version` or later.
///
/// Store errors count as "not yet".
pub async fn wait_for_version(
    store: &dyn RideStore,
    ride_id: RideId,
    version: u64,
    timeout: Duration,
) -> Option<Ride> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(ride)) = store.get(ride_id).await {
            if ride.version >= version {
                return Some(ride);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub mod fixtures {
    use ride_dispatch::{
        Caller, Fare, FareQuote, GeoPoint, Location, PassengerId, PaymentMethod, RideRequest,
        RiderId,
    };

    pub fn location(lat: f64, lng: f64) -> Location {
        Location {
            point: GeoPoint::new(lat, lng),
            address: format!("{lat:.4},{lng:.4}"),
        }
    }

    pub fn quote(amount_minor: i64) -> FareQuote {
        FareQuote {
            fare: Fare {
                amount_minor,
                currency: "USD".to_string(),
            },
            payment_method: PaymentMethod::Card,
        }
    }

    /// A short downtown trip.
    pub fn ride_request() -> RideRequest {
        RideRequest {
            pickup: location(40.7128, -74.0060),
            destination: location(40.7306, -73.9866),
            quote: quote(1_850),
        }
    }

    pub fn passenger() -> (PassengerId, Caller) {
        let id = PassengerId::new();
        (id, Caller::passenger(id))
    }

    pub fn rider() -> (RiderId, Caller) {
        let id = RiderId::new();
        (id, Caller::rider(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ride_dispatch::RideStatus;

    fn ride() -> Ride {
        let request = fixtures::ride_request();
        let (passenger_id, _) = fixtures::passenger();
        Ride::requested(
            passenger_id,
            request.pickup,
            request.destination,
            request.quote,
            Side::Passenger,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn burst_faults_expire() {
        let store = FlakyRideStore::in_memory();
        let ride = store.create(&ride()).await.unwrap();
        store.fail_next(Fault::Unavailable, 2);

        assert!(store.get(ride.id).await.unwrap_err().is_transient());
        assert!(store.get(ride.id).await.is_err());
        assert!(store.get(ride.id).await.unwrap().is_some());
        assert_eq!(store.injected_failures(), 2);
        assert_eq!(store.calls(), 4);
    }

    #[tokio::test]
    async fn outage_lasts_until_recovered() {
        let store = FlakyRideStore::in_memory();
        let ride = ride();
        store.outage(Fault::Backend);

        let err = store.create(&ride).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(store.get(ride.id).await.is_err());

        store.recover();
        store.create(&ride).await.unwrap();
        let patch = RidePatch::transition(RideStatus::Cancelled, Utc::now());
        assert!(store.conditional_update(ride.id, 1, &patch).await.unwrap().is_updated());
    }

    #[tokio::test]
    async fn geo_index_filters_by_radius() {
        let geo = StaticGeoIndex::new();
        let origin = GeoPoint::new(40.7128, -74.0060);
        let (near, far) = (RideId::new(), RideId::new());
        geo.add_ride(near, GeoPoint::new(40.7138, -74.0060));
        geo.add_ride(far, GeoPoint::new(41.7128, -74.0060));

        let hits = geo.nearby_rides(origin, 1_000.0).await.unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, near);
        assert!((hits[0].distance_m - 111.0).abs() < 2.0);
    }

    #[tokio::test]
    async fn offline_rider_has_no_location() {
        let geo = StaticGeoIndex::new();
        let rider = RiderId::new();
        geo.rider_online(rider, GeoPoint::new(0.0, 0.0));
        assert!(geo.rider_location(rider).await.unwrap().is_some());
        geo.rider_offline(rider);
        assert!(geo.rider_location(rider).await.unwrap().is_none());
    }
}
