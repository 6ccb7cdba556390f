//! Single-winner ride acceptance.
//!
//! Any number of riders may call [`AcceptanceArbiter::accept`] for the same
//! ride at once, from any process. There is no lock: the winner is whoever
//! lands the compare-and-swap on the origin record first. Losers see a
//! version conflict, re-read, find the ride no longer `requested`, and get
//! `AlreadyTaken`.
//!
//! Retries are bounded so a heavily contended ride produces a definitive
//! answer instead of spinning.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{DispatchError, Result};
use crate::ride::{Ride, RideId, RidePatch, RideStatus, RiderId};
use crate::store::{timed, RideStore, UpdateOutcome};
use crate::transition;

#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    Accepted(Ride),
    AlreadyTaken,
}

pub struct AcceptanceArbiter {
    origin: Arc<dyn RideStore>,
    max_attempts: u32,
    store_timeout: Duration,
}

impl AcceptanceArbiter {
    pub fn new(origin: Arc<dyn RideStore>, max_attempts: u32, store_timeout: Duration) -> Self {
        Self {
            origin,
            max_attempts: max_attempts.max(1),
            store_timeout,
        }
    }

    /// Bind `rider_id` to a `requested` ride.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotFound`] if the ride does not exist
    /// - [`DispatchError::IllegalState`] if a `requested` ride already carries a rider
    /// - [`DispatchError::Store`] on store failures
    pub async fn accept(&self, ride_id: RideId, rider_id: RiderId) -> Result<AcceptOutcome> {
        for attempt in 1..=self.max_attempts {
            let ride = timed(self.store_timeout, self.origin.get(ride_id))
                .await?
                .ok_or(DispatchError::NotFound(ride_id))?;

            if ride.status != RideStatus::Requested {
                debug!(%ride_id, %rider_id, status = %ride.status, "ride no longer open");
                return Ok(AcceptOutcome::AlreadyTaken);
            }
            if let Some(bound) = ride.rider_id {
                return Err(DispatchError::IllegalState {
                    ride_id,
                    message: format!("requested ride already bound to rider {bound}"),
                });
            }
            transition::validate(ride.status, RideStatus::Matched).map_err(|e| {
                DispatchError::IllegalTransition {
                    ride_id,
                    from: e.from,
                    to: e.to,
                }
            })?;

            let patch = RidePatch::transition(RideStatus::Matched, Utc::now()).with_rider(rider_id);
            let outcome = timed(
                self.store_timeout,
                self.origin.conditional_update(ride_id, ride.version, &patch),
            )
            .await?;

            match outcome {
                UpdateOutcome::Updated(matched) => {
                    info!(%ride_id, %rider_id, version = matched.version, attempt, "ride accepted");
                    return Ok(AcceptOutcome::Accepted(matched));
                }
                UpdateOutcome::VersionConflict { actual } => {
                    debug!(
                        %ride_id,
                        %rider_id,
                        expected = ride.version,
                        actual,
                        attempt,
                        "acceptance lost a race, re-reading"
                    );
                }
                UpdateOutcome::NotFound => return Err(DispatchError::NotFound(ride_id)),
            }
        }

        warn!(
            %ride_id,
            %rider_id,
            attempts = self.max_attempts,
            "acceptance retries exhausted"
        );
        Ok(AcceptOutcome::AlreadyTaken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ride::fixtures::requested_ride;
    use crate::store::MemoryRideStore;

    fn arbiter(store: Arc<MemoryRideStore>) -> AcceptanceArbiter {
        AcceptanceArbiter::new(store, 3, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn accepts_open_ride() {
        let store = Arc::new(MemoryRideStore::new());
        let ride = store.create(&requested_ride()).await.unwrap();
        let rider = RiderId::new();

        let outcome = arbiter(store.clone()).accept(ride.id, rider).await.unwrap();

        let AcceptOutcome::Accepted(matched) = outcome else {
            panic!("expected acceptance, got {outcome:?}");
        };
        assert_eq!(matched.status, RideStatus::Matched);
        assert_eq!(matched.rider_id, Some(rider));
        assert_eq!(matched.version, 2);
        assert!(matched.matched_at.is_some());
    }

    #[tokio::test]
    async fn second_rider_is_told_already_taken() {
        let store = Arc::new(MemoryRideStore::new());
        let ride = store.create(&requested_ride()).await.unwrap();
        let arbiter = arbiter(store.clone());

        arbiter.accept(ride.id, RiderId::new()).await.unwrap();
        let outcome = arbiter.accept(ride.id, RiderId::new()).await.unwrap();

        assert_eq!(outcome, AcceptOutcome::AlreadyTaken);
    }

    #[tokio::test]
    async fn missing_ride_is_not_found() {
        let store = Arc::new(MemoryRideStore::new());
        let err = arbiter(store).accept(RideId::new(), RiderId::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn requested_ride_with_rider_is_illegal_state() {
        let store = Arc::new(MemoryRideStore::new());
        let mut ride = requested_ride();
        ride.rider_id = Some(RiderId::new());
        store.create(&ride).await.unwrap();

        let err = arbiter(store).accept(ride.id, RiderId::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::IllegalState { .. }));
    }
}
