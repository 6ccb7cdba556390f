//! Candidate discovery for riders and rides.
//!
//! The coordinator reads; it never writes ride state. Acceptance goes
//! through the [`AcceptanceArbiter`](crate::arbiter::AcceptanceArbiter).
//!
//! Declines are kept in a transient in-process map so a rider who passed on
//! a ride is not shown it again right away. Losing that map (restart,
//! another node) only means a ride may be resurfaced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::collab::{GeoIndex, Nearby};
use crate::config::MatchingConfig;
use crate::error::{DispatchError, Result};
use crate::ride::{Ride, RideId, RideStatus, RideSummary, RiderId};
use crate::store::{timed, RideStore};

const LOOKUP_CONCURRENCY: usize = 8;

pub struct MatchingCoordinator {
    origin: Arc<dyn RideStore>,
    geo: Arc<dyn GeoIndex>,
    declined: DashMap<RideId, HashMap<RiderId, Instant>>,
    config: MatchingConfig,
    store_timeout: Duration,
}

impl MatchingCoordinator {
    pub fn new(
        origin: Arc<dyn RideStore>,
        geo: Arc<dyn GeoIndex>,
        config: MatchingConfig,
        store_timeout: Duration,
    ) -> Self {
        Self {
            origin,
            geo,
            declined: DashMap::new(),
            config,
            store_timeout,
        }
    }

    fn check_radius(&self, radius_m: f64) -> Result<()> {
        if radius_m.is_finite() && radius_m > 0.0 && radius_m <= self.config.max_radius_m {
            Ok(())
        } else {
            Err(DispatchError::InvalidRequest(format!(
                "radius must be in (0, {}] meters, got {radius_m}",
                self.config.max_radius_m
            )))
        }
    }

    /// Open rides near the rider, nearest first.
    ///
    /// Offline riders (no known location) get an empty list.
    pub async fn list_available_rides(
        &self,
        rider_id: RiderId,
        radius_m: f64,
    ) -> Result<Vec<RideSummary>> {
        self.check_radius(radius_m)?;

        let Some(point) = self
            .geo
            .rider_location(rider_id)
            .await
            .map_err(geo_error)?
        else {
            debug!(%rider_id, "rider has no known location");
            return Ok(Vec::new());
        };

        let mut hits = self
            .geo
            .nearby_rides(point, radius_m)
            .await
            .map_err(geo_error)?;
        hits.retain(|hit| !self.has_declined(hit.id, rider_id));
        hits.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));

        // Lookups stop once enough open rides are found; at most
        // LOOKUP_CONCURRENCY reads run past the last one kept.
        let open: Vec<(Ride, f64)> = stream::iter(hits)
            .map(|hit| async move {
                let ride = timed(self.store_timeout, self.origin.get(hit.id)).await?;
                Ok::<_, DispatchError>(ride.map(|ride| (ride, hit.distance_m)))
            })
            .buffered(LOOKUP_CONCURRENCY)
            .try_filter_map(|found| async move {
                Ok(found.filter(|(ride, _)| {
                    ride.status == RideStatus::Requested && ride.rider_id.is_none()
                }))
            })
            .take(self.config.max_candidates)
            .try_collect()
            .await?;

        let summaries: Vec<RideSummary> = open
            .into_iter()
            .map(|(ride, distance_m)| ride.summary(distance_m))
            .collect();

        debug!(%rider_id, radius_m, candidates = summaries.len(), "listed available rides");
        Ok(summaries)
    }

    /// Online riders near a requested ride's pickup, nearest first.
    pub async fn list_eligible_riders(
        &self,
        ride_id: RideId,
        radius_m: f64,
    ) -> Result<Vec<Nearby<RiderId>>> {
        self.check_radius(radius_m)?;

        let ride = timed(self.store_timeout, self.origin.get(ride_id))
            .await?
            .ok_or(DispatchError::NotFound(ride_id))?;
        if ride.status != RideStatus::Requested {
            return Ok(Vec::new());
        }

        let mut riders = self
            .geo
            .nearby_riders(ride.pickup.point, radius_m)
            .await
            .map_err(geo_error)?;
        riders.retain(|hit| !self.has_declined(ride_id, hit.id));
        riders.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        riders.truncate(self.config.max_candidates);
        Ok(riders)
    }

    /// Record that `rider_id` passed on `ride_id`. The ride stays `requested`.
    pub async fn reject(
        &self,
        ride_id: RideId,
        rider_id: RiderId,
        reason: Option<&str>,
    ) -> Result<()> {
        let ride = timed(self.store_timeout, self.origin.get(ride_id))
            .await?
            .ok_or(DispatchError::NotFound(ride_id))?;

        self.prune_declined();
        self.declined
            .entry(ride_id)
            .or_default()
            .insert(rider_id, Instant::now());

        info!(%ride_id, %rider_id, status = %ride.status, reason = reason.unwrap_or(""), "ride declined");
        Ok(())
    }

    /// Whether `rider_id` declined `ride_id` within the decline TTL.
    pub fn has_declined(&self, ride_id: RideId, rider_id: RiderId) -> bool {
        let ttl = self.config.decline_ttl();
        self.declined
            .get(&ride_id)
            .and_then(|riders| riders.get(&rider_id).copied())
            .is_some_and(|at| at.elapsed() < ttl)
    }

    fn prune_declined(&self) {
        let ttl = self.config.decline_ttl();
        self.declined.retain(|_, riders| {
            riders.retain(|_, at| at.elapsed() < ttl);
            !riders.is_empty()
        });
    }
}

fn geo_error(source: anyhow::Error) -> DispatchError {
    DispatchError::Collaborator {
        collaborator: "geospatial index",
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ride::fixtures::requested_ride;
    use crate::ride::{GeoPoint, RidePatch};
    use crate::error::StoreError;
    use crate::ride::Side;
    use crate::store::{MemoryRideStore, ScanCursor, UpdateOutcome};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FixedGeo {
        rider_at: Option<GeoPoint>,
        rides: Vec<Nearby<RideId>>,
        riders: Vec<Nearby<RiderId>>,
    }

    #[async_trait]
    impl GeoIndex for FixedGeo {
        async fn nearby_rides(&self, _: GeoPoint, radius_m: f64) -> anyhow::Result<Vec<Nearby<RideId>>> {
            Ok(self.rides.iter().copied().filter(|h| h.distance_m <= radius_m).collect())
        }

        async fn nearby_riders(&self, _: GeoPoint, radius_m: f64) -> anyhow::Result<Vec<Nearby<RiderId>>> {
            Ok(self.riders.iter().copied().filter(|h| h.distance_m <= radius_m).collect())
        }

        async fn rider_location(&self, _: RiderId) -> anyhow::Result<Option<GeoPoint>> {
            Ok(self.rider_at)
        }
    }

    fn coordinator(store: Arc<MemoryRideStore>, geo: FixedGeo) -> MatchingCoordinator {
        MatchingCoordinator::new(store, Arc::new(geo), MatchingConfig::default(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn lists_only_open_rides_nearest_first() {
        let store = Arc::new(MemoryRideStore::new());
        let near = store.create(&requested_ride()).await.unwrap();
        let far = store.create(&requested_ride()).await.unwrap();
        let taken = store.create(&requested_ride()).await.unwrap();
        store
            .conditional_update(
                taken.id,
                1,
                &RidePatch::transition(RideStatus::Matched, Utc::now()).with_rider(RiderId::new()),
            )
            .await
            .unwrap();

        let geo = FixedGeo {
            rider_at: Some(GeoPoint::new(40.0, -73.0)),
            rides: vec![
                Nearby { id: far.id, distance_m: 900.0 },
                Nearby { id: taken.id, distance_m: 50.0 },
                Nearby { id: near.id, distance_m: 100.0 },
                Nearby { id: RideId::new(), distance_m: 10.0 },
            ],
            ..FixedGeo::default()
        };
        let rides = coordinator(store, geo)
            .list_available_rides(RiderId::new(), 1_000.0)
            .await
            .unwrap();

        let ids: Vec<RideId> = rides.iter().map(|r| r.ride_id).collect();
        assert_eq!(ids, vec![near.id, far.id]);
        assert_eq!(rides[0].distance_m, 100.0);
    }

    /// Counts point reads.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryRideStore,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl RideStore for CountingStore {
        async fn get(&self, id: RideId) -> std::result::Result<Option<crate::ride::Ride>, StoreError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(id).await
        }

        async fn create(&self, ride: &crate::ride::Ride) -> std::result::Result<crate::ride::Ride, StoreError> {
            self.inner.create(ride).await
        }

        async fn conditional_update(
            &self,
            id: RideId,
            expected_version: u64,
            patch: &RidePatch,
        ) -> std::result::Result<UpdateOutcome, StoreError> {
            self.inner.conditional_update(id, expected_version, patch).await
        }

        async fn origins_touched_since(
            &self,
            origin_side: Side,
            since: DateTime<Utc>,
            after: Option<ScanCursor>,
            limit: usize,
        ) -> std::result::Result<Vec<crate::ride::Ride>, StoreError> {
            self.inner.origins_touched_since(origin_side, since, after, limit).await
        }
    }

    #[tokio::test]
    async fn dense_area_stops_reading_once_full() {
        let store = Arc::new(CountingStore::default());
        let mut rides = Vec::new();
        for n in 0..100 {
            let ride = store.create(&requested_ride()).await.unwrap();
            rides.push(Nearby { id: ride.id, distance_m: f64::from(n) });
        }
        let geo = FixedGeo {
            rider_at: Some(GeoPoint::new(40.0, -73.0)),
            rides,
            ..FixedGeo::default()
        };
        let config = MatchingConfig {
            max_candidates: 3,
            ..MatchingConfig::default()
        };
        let coordinator =
            MatchingCoordinator::new(store.clone(), Arc::new(geo), config, Duration::from_secs(1));

        let listed = coordinator
            .list_available_rides(RiderId::new(), 1_000.0)
            .await
            .unwrap();

        assert_eq!(listed.len(), 3);
        assert_eq!(listed[2].distance_m, 2.0);
        assert!(store.gets.load(Ordering::SeqCst) <= 3 + LOOKUP_CONCURRENCY);
    }

    #[tokio::test]
    async fn offline_rider_sees_nothing() {
        let store = Arc::new(MemoryRideStore::new());
        let rides = coordinator(store, FixedGeo::default())
            .list_available_rides(RiderId::new(), 1_000.0)
            .await
            .unwrap();
        assert!(rides.is_empty());
    }

    #[tokio::test]
    async fn rejects_out_of_range_radius() {
        let store = Arc::new(MemoryRideStore::new());
        let coordinator = coordinator(store, FixedGeo::default());
        for radius in [0.0, -1.0, f64::NAN, 1e9] {
            assert!(matches!(
                coordinator.list_available_rides(RiderId::new(), radius).await,
                Err(DispatchError::InvalidRequest(_))
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn declined_ride_is_hidden_until_ttl() {
        let store = Arc::new(MemoryRideStore::new());
        let ride = store.create(&requested_ride()).await.unwrap();
        let rider = RiderId::new();
        let geo = FixedGeo {
            rider_at: Some(GeoPoint::new(40.0, -73.0)),
            rides: vec![Nearby { id: ride.id, distance_m: 10.0 }],
            ..FixedGeo::default()
        };
        let coordinator = coordinator(store.clone(), geo);

        coordinator.reject(ride.id, rider, Some("too far")).await.unwrap();
        assert!(coordinator.list_available_rides(rider, 100.0).await.unwrap().is_empty());
        assert_eq!(
            coordinator.list_available_rides(RiderId::new(), 100.0).await.unwrap().len(),
            1
        );
        assert_eq!(store.get(ride.id).await.unwrap().unwrap().status, RideStatus::Requested);

        tokio::time::advance(MatchingConfig::default().decline_ttl() + Duration::from_secs(1)).await;
        assert_eq!(coordinator.list_available_rides(rider, 100.0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn eligible_riders_exclude_decliners() {
        let store = Arc::new(MemoryRideStore::new());
        let ride = store.create(&requested_ride()).await.unwrap();
        let (a, b) = (RiderId::new(), RiderId::new());
        let geo = FixedGeo {
            riders: vec![
                Nearby { id: b, distance_m: 300.0 },
                Nearby { id: a, distance_m: 200.0 },
            ],
            ..FixedGeo::default()
        };
        let coordinator = coordinator(store, geo);
        coordinator.reject(ride.id, b, None).await.unwrap();

        let riders = coordinator.list_eligible_riders(ride.id, 1_000.0).await.unwrap();

        assert_eq!(riders.len(), 1);
        assert_eq!(riders[0].id, a);
    }

    #[tokio::test]
    async fn reject_unknown_ride_is_not_found() {
        let store = Arc::new(MemoryRideStore::new());
        let err = coordinator(store, FixedGeo::default())
            .reject(RideId::new(), RiderId::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }
}
