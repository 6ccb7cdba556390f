//! Persistence façade over ride records.
//!
//! Each side (passenger, rider) has its own [`RideStore`]. The only mutation
//! primitive is [`RideStore::conditional_update`], an atomic
//! compare-and-swap on the record's `version`.
//!
//! ## CAS Semantics
//!
//! - The write lands only if the stored version equals `expected_version`
//! - It is a single storage-level operation, never read-then-write on the client
//! - Every successful write stamps `updated_at` and moves `version` per the
//!   patch's [`VersionStep`](crate::ride::VersionStep)

pub mod memory;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::ride::{Ride, RideId, RidePatch, Side};

pub use memory::MemoryRideStore;

/// Result of a conditional update.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The write was applied; carries the record as stored.
    Updated(Ride),
    /// The stored version did not match.
    VersionConflict { actual: u64 },
    NotFound,
}

impl UpdateOutcome {
    #[must_use]
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }
}

/// Storage abstraction for one side's copy of every ride.
#[async_trait]
pub trait RideStore: Send + Sync {
    /// Gets a ride by id. `None` means not found.
    async fn get(&self, id: RideId) -> Result<Option<Ride>, StoreError>;

    /// Inserts a new record as given.
    ///
    /// Fails with [`StoreError::AlreadyExists`] if the id is taken.
    async fn create(&self, ride: &Ride) -> Result<Ride, StoreError>;

    /// Atomically applies `patch` if the stored version equals `expected_version`.
    async fn conditional_update(
        &self,
        id: RideId,
        expected_version: u64,
        patch: &RidePatch,
    ) -> Result<UpdateOutcome, StoreError>;

    /// Rides created on `origin_side` with `updated_at >= since`.
    ///
    /// Ordered by `(updated_at, id)` and strictly after `after` when given,
    /// at most `limit`. Mirror copies of rides owned by the other side are
    /// never returned, so a page holds only records this store is
    /// authoritative for.
    async fn origins_touched_since(
        &self,
        origin_side: Side,
        since: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> Result<Vec<Ride>, StoreError>;
}

/// Position in an `(updated_at, id)` ordered scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScanCursor {
    pub updated_at: DateTime<Utc>,
    pub id: RideId,
}

impl ScanCursor {
    /// The cursor just past `ride`.
    pub fn after(ride: &Ride) -> Self {
        Self {
            updated_at: ride.updated_at,
            id: ride.id,
        }
    }
}

/// The two physical stores.
#[derive(Clone)]
pub struct RideStores {
    passenger: Arc<dyn RideStore>,
    rider: Arc<dyn RideStore>,
}

impl RideStores {
    pub fn new(passenger: Arc<dyn RideStore>, rider: Arc<dyn RideStore>) -> Self {
        Self { passenger, rider }
    }

    /// Two independent in-memory stores.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryRideStore::new()),
            Arc::new(MemoryRideStore::new()),
        )
    }

    pub fn side(&self, side: Side) -> &Arc<dyn RideStore> {
        match side {
            Side::Passenger => &self.passenger,
            Side::Rider => &self.rider,
        }
    }

    /// The authoritative store for rides created on `origin_side`.
    pub fn origin(&self, origin_side: Side) -> &Arc<dyn RideStore> {
        self.side(origin_side)
    }

    /// The mirror store for rides created on `origin_side`.
    pub fn mirror(&self, origin_side: Side) -> &Arc<dyn RideStore> {
        self.side(origin_side.opposite())
    }
}

/// Bound a store call by `budget`, mapping elapsed time to [`StoreError::Timeout`].
pub(crate) async fn timed<T, F>(budget: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            millis: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_is_opposite_of_origin() {
        let stores = RideStores::in_memory();
        assert!(Arc::ptr_eq(
            stores.origin(Side::Passenger),
            stores.side(Side::Passenger)
        ));
        assert!(Arc::ptr_eq(
            stores.mirror(Side::Passenger),
            stores.side(Side::Rider)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_maps_elapsed_to_timeout() {
        let result: Result<(), StoreError> = timed(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout { millis: 50 })));
    }
}
