//! In-memory ride store.
//!
//! ## Limitations
//!
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits
//!
//! The compare-and-swap is atomic because `DashMap::get_mut` holds the
//! shard write lock for the whole check-and-apply.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{RideStore, ScanCursor, UpdateOutcome};
use crate::error::StoreError;
use crate::ride::{Ride, RideId, RidePatch, Side, VersionStep};

#[derive(Debug, Default)]
pub struct MemoryRideStore {
    rides: DashMap<RideId, Ride>,
}

impl MemoryRideStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rides.is_empty()
    }
}

#[async_trait]
impl RideStore for MemoryRideStore {
    async fn get(&self, id: RideId) -> Result<Option<Ride>, StoreError> {
        Ok(self.rides.get(&id).map(|ride| ride.clone()))
    }

    async fn create(&self, ride: &Ride) -> Result<Ride, StoreError> {
        match self.rides.entry(ride.id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(ride.id)),
            Entry::Vacant(slot) => {
                slot.insert(ride.clone());
                Ok(ride.clone())
            }
        }
    }

    async fn conditional_update(
        &self,
        id: RideId,
        expected_version: u64,
        patch: &RidePatch,
    ) -> Result<UpdateOutcome, StoreError> {
        let Some(mut ride) = self.rides.get_mut(&id) else {
            return Ok(UpdateOutcome::NotFound);
        };

        if ride.version != expected_version {
            return Ok(UpdateOutcome::VersionConflict {
                actual: ride.version,
            });
        }

        if let VersionStep::Adopt(version) = patch.version_step {
            if version <= expected_version {
                return Err(StoreError::Backend(anyhow::anyhow!(
                    "adopted version {version} does not advance {expected_version} for ride {id}"
                )));
            }
        }

        ride.apply(patch, Utc::now());
        Ok(UpdateOutcome::Updated(ride.clone()))
    }

    async fn origins_touched_since(
        &self,
        origin_side: Side,
        since: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> Result<Vec<Ride>, StoreError> {
        let mut rides: Vec<Ride> = self
            .rides
            .iter()
            .filter(|ride| ride.origin_side == origin_side && ride.updated_at >= since)
            .filter(|ride| after.map_or(true, |cursor| ScanCursor::after(ride) > cursor))
            .map(|ride| ride.clone())
            .collect();
        rides.sort_by_key(ScanCursor::after);
        rides.truncate(limit);
        Ok(rides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ride::fixtures::requested_ride;
    use crate::ride::{RideStatus, RiderId};

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = MemoryRideStore::new();
        let ride = requested_ride();
        store.create(&ride).await.unwrap();
        assert!(matches!(
            store.create(&ride).await,
            Err(StoreError::AlreadyExists(id)) if id == ride.id
        ));
    }

    #[tokio::test]
    async fn conditional_update_checks_version() {
        let store = MemoryRideStore::new();
        let ride = store.create(&requested_ride()).await.unwrap();
        let patch = RidePatch::transition(RideStatus::Matched, Utc::now()).with_rider(RiderId::new());

        let first = store.conditional_update(ride.id, 1, &patch).await.unwrap();
        let UpdateOutcome::Updated(updated) = first else {
            panic!("expected update, got {first:?}");
        };
        assert_eq!(updated.version, 2);

        let stale = store.conditional_update(ride.id, 1, &patch).await.unwrap();
        assert_eq!(stale, UpdateOutcome::VersionConflict { actual: 2 });
    }

    #[tokio::test]
    async fn conditional_update_on_missing_ride() {
        let store = MemoryRideStore::new();
        let outcome = store
            .conditional_update(RideId::new(), 1, &RidePatch::default())
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::NotFound);
    }

    #[tokio::test]
    async fn adopt_must_advance_version() {
        let store = MemoryRideStore::new();
        let ride = store.create(&requested_ride()).await.unwrap();
        let patch = RidePatch {
            version_step: VersionStep::Adopt(1),
            ..RidePatch::default()
        };
        assert!(store.conditional_update(ride.id, 1, &patch).await.is_err());
    }

    #[tokio::test]
    async fn origins_touched_since_filters_and_orders() {
        let store = MemoryRideStore::new();
        let mut old = requested_ride();
        old.updated_at = Utc::now() - chrono::Duration::days(2);
        let fresh = requested_ride();
        let mut mirrored = requested_ride();
        mirrored.origin_side = Side::Rider;
        store.create(&old).await.unwrap();
        store.create(&fresh).await.unwrap();
        store.create(&mirrored).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let touched = store
            .origins_touched_since(Side::Passenger, since, None, 10)
            .await
            .unwrap();
        assert_eq!(touched.len(), 1);
        assert_eq!(touched[0].id, fresh.id);
    }

    #[tokio::test]
    async fn origins_touched_since_pages_by_cursor() {
        let store = MemoryRideStore::new();
        let at = Utc::now() - chrono::Duration::minutes(10);
        let mut ids = Vec::new();
        for _ in 0..3 {
            // Same timestamp: the id breaks the tie.
            let mut ride = requested_ride();
            ride.updated_at = at;
            ids.push(store.create(&ride).await.unwrap().id);
        }
        ids.sort();

        let since = at - chrono::Duration::minutes(1);
        let mut seen = Vec::new();
        let mut after = None;
        loop {
            let page = store
                .origins_touched_since(Side::Passenger, since, after, 2)
                .await
                .unwrap();
            seen.extend(page.iter().map(|ride| ride.id));
            match page.last() {
                Some(last) if page.len() == 2 => after = Some(ScanCursor::after(last)),
                _ => break,
            }
        }
        assert_eq!(seen, ids);
    }
}
