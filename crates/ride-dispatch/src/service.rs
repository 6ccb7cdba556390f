//! The dispatch API exposed to request handlers.
//!
//! Every state-changing operation follows the same path:
//!
//! 1. read the origin record
//! 2. authorize the caller against it
//! 3. gate the change through the transition table
//! 4. conditional write on the origin
//! 5. publish a [`RideEvent`] and hand the snapshot to the synchronizer
//!
//! The caller gets its answer as soon as step 4 succeeds; mirroring happens
//! in the background.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::arbiter::{AcceptOutcome, AcceptanceArbiter};
use crate::collab::{ActorRole, Caller, GeoIndex, Nearby, RideRequest};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::events::{EventBus, RecordCopy, RideEvent};
use crate::matching::MatchingCoordinator;
use crate::ride::{Cancellation, Ride, RideId, RidePatch, RideStatus, RideSummary, RiderId};
use crate::store::{timed, RideStore, RideStores, UpdateOutcome};
use crate::sync::{OriginChange, Synchronizer};
use crate::transition::{self, Transition};

pub struct DispatchService {
    stores: RideStores,
    arbiter: AcceptanceArbiter,
    matching: MatchingCoordinator,
    sync: Arc<Synchronizer>,
    bus: EventBus,
    config: DispatchConfig,
}

impl DispatchService {
    pub fn new(
        stores: RideStores,
        geo: Arc<dyn GeoIndex>,
        sync: Arc<Synchronizer>,
        bus: EventBus,
        config: DispatchConfig,
    ) -> Self {
        let origin = Arc::clone(stores.origin(config.origin_side));
        let arbiter = AcceptanceArbiter::new(
            Arc::clone(&origin),
            config.arbiter_max_attempts,
            config.store_timeout(),
        );
        let matching =
            MatchingCoordinator::new(origin, geo, config.matching.clone(), config.store_timeout());
        Self {
            stores,
            arbiter,
            matching,
            sync,
            bus,
            config,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    fn origin(&self) -> &Arc<dyn RideStore> {
        self.stores.origin(self.config.origin_side)
    }

    /// Create a ride on the origin store.
    #[tracing::instrument(skip(self, caller, request), fields(user_id = %caller.user_id))]
    pub async fn request_ride(&self, caller: &Caller, request: RideRequest) -> Result<Ride> {
        let passenger_id = caller
            .as_passenger()
            .ok_or_else(|| DispatchError::Forbidden("only passengers can request rides".into()))?;

        if !request.pickup.point.is_valid() || !request.destination.point.is_valid() {
            return Err(DispatchError::InvalidRequest(
                "pickup and destination must be valid coordinates".into(),
            ));
        }
        if request.quote.fare.amount_minor < 0 || request.quote.fare.currency.is_empty() {
            return Err(DispatchError::InvalidRequest(
                "fare must be non-negative with a currency".into(),
            ));
        }

        let ride = Ride::requested(
            passenger_id,
            request.pickup,
            request.destination,
            request.quote,
            self.config.origin_side,
            Utc::now(),
        );
        let created = timed(self.config.store_timeout(), self.origin().create(&ride)).await?;

        info!(ride_id = %created.id, %passenger_id, "ride requested");
        self.publish(&created);
        Ok(created)
    }

    /// Open rides near the calling rider.
    pub async fn list_available_rides(
        &self,
        caller: &Caller,
        radius_m: f64,
    ) -> Result<Vec<RideSummary>> {
        let rider_id = require_rider(caller)?;
        self.matching.list_available_rides(rider_id, radius_m).await
    }

    /// Online riders near a requested ride's pickup.
    pub async fn list_eligible_riders(
        &self,
        ride_id: RideId,
        caller: &Caller,
        radius_m: f64,
    ) -> Result<Vec<Nearby<RiderId>>> {
        if caller.role == ActorRole::Rider {
            return Err(DispatchError::Forbidden(
                "riders cannot list other riders".into(),
            ));
        }
        self.matching.list_eligible_riders(ride_id, radius_m).await
    }

    /// Bind the calling rider to a requested ride.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyTaken`] when another rider won or the ride is
    /// no longer open.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id))]
    pub async fn accept_ride(&self, ride_id: RideId, caller: &Caller) -> Result<Ride> {
        let rider_id = require_rider(caller)?;

        match self.arbiter.accept(ride_id, rider_id).await? {
            AcceptOutcome::Accepted(ride) => {
                self.publish(&ride);
                Ok(ride)
            }
            AcceptOutcome::AlreadyTaken => Err(DispatchError::AlreadyTaken(ride_id)),
        }
    }

    /// Decline a ride. It stays `requested` for other riders.
    pub async fn reject_ride(
        &self,
        ride_id: RideId,
        caller: &Caller,
        reason: Option<&str>,
    ) -> Result<()> {
        let rider_id = require_rider(caller)?;
        self.matching.reject(ride_id, rider_id, reason).await
    }

    /// Move a ride to `target`.
    ///
    /// With `expected_version`, the write only lands against exactly that
    /// version, so a client replaying a request it already saw succeed gets
    /// `VersionConflict`. Without it, the change is re-validated against the
    /// latest record up to the configured attempt bound.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id, role = ?caller.role))]
    pub async fn advance_status(
        &self,
        ride_id: RideId,
        caller: &Caller,
        target: RideStatus,
        expected_version: Option<u64>,
    ) -> Result<Ride> {
        if target == RideStatus::Matched {
            return Err(DispatchError::InvalidRequest(
                "riders are bound through accept_ride".into(),
            ));
        }
        self.change_status(ride_id, caller, target, expected_version, None)
            .await
    }

    /// Cancel a ride from any non-terminal status.
    ///
    /// Cancelling a ride that is already cancelled or completed returns it
    /// unchanged.
    #[tracing::instrument(skip(self, caller), fields(user_id = %caller.user_id, role = ?caller.role))]
    pub async fn cancel_ride(
        &self,
        ride_id: RideId,
        caller: &Caller,
        reason: Option<String>,
    ) -> Result<Ride> {
        self.change_status(ride_id, caller, RideStatus::Cancelled, None, reason)
            .await
    }

    /// Read one copy of a ride. The mirror may lag the origin.
    pub async fn get_ride(&self, ride_id: RideId, copy: RecordCopy) -> Result<Ride> {
        let store = match copy {
            RecordCopy::Origin => self.origin(),
            RecordCopy::Mirror => self.stores.mirror(self.config.origin_side),
        };
        timed(self.config.store_timeout(), store.get(ride_id))
            .await?
            .ok_or(DispatchError::NotFound(ride_id))
    }

    async fn read_origin(&self, ride_id: RideId) -> Result<Ride> {
        self.get_ride(ride_id, RecordCopy::Origin).await
    }

    async fn change_status(
        &self,
        ride_id: RideId,
        caller: &Caller,
        target: RideStatus,
        expected_version: Option<u64>,
        reason: Option<String>,
    ) -> Result<Ride> {
        let attempts = if expected_version.is_some() {
            1
        } else {
            self.config.arbiter_max_attempts
        };
        let mut last_conflict = None;

        for _ in 0..attempts {
            let ride = self.read_origin(ride_id).await?;

            if let Some(expected) = expected_version {
                if expected != ride.version {
                    return Err(DispatchError::VersionConflict {
                        ride_id,
                        expected,
                        actual: ride.version,
                    });
                }
            }

            authorize(caller, &ride, target)?;

            if target == RideStatus::Cancelled && ride.status.is_terminal() {
                debug!(%ride_id, status = %ride.status, "cancel on terminal ride is a no-op");
                return Ok(ride);
            }

            match transition::validate(ride.status, target) {
                Err(illegal) => {
                    return Err(DispatchError::IllegalTransition {
                        ride_id,
                        from: illegal.from,
                        to: illegal.to,
                    })
                }
                Ok(Transition::NoOp) => {
                    debug!(%ride_id, status = %ride.status, "status already reached");
                    return Ok(ride);
                }
                Ok(Transition::Apply) => {}
            }

            let mut patch = RidePatch::transition(target, Utc::now());
            if target == RideStatus::Cancelled {
                patch = patch.with_cancellation(Cancellation {
                    by: caller.role,
                    actor_id: caller.user_id,
                    reason: reason.clone(),
                });
            }

            let outcome = timed(
                self.config.store_timeout(),
                self.origin().conditional_update(ride_id, ride.version, &patch),
            )
            .await?;

            match outcome {
                UpdateOutcome::Updated(updated) => {
                    info!(
                        %ride_id,
                        from = %ride.status,
                        to = %updated.status,
                        version = updated.version,
                        "ride status changed"
                    );
                    self.publish(&updated);
                    return Ok(updated);
                }
                UpdateOutcome::VersionConflict { actual } => {
                    debug!(%ride_id, expected = ride.version, actual, "status change lost a race");
                    last_conflict = Some((ride.version, actual));
                }
                UpdateOutcome::NotFound => return Err(DispatchError::NotFound(ride_id)),
            }
        }

        let (expected, actual) = last_conflict.unwrap_or_default();
        Err(DispatchError::VersionConflict {
            ride_id,
            expected,
            actual,
        })
    }

    /// Announce an origin write and start mirroring it.
    fn publish(&self, ride: &Ride) {
        self.bus.emit(RideEvent::from_ride(ride, RecordCopy::Origin));
        self.sync.spawn_propagate(OriginChange::new(ride.clone()));
    }
}

fn require_rider(caller: &Caller) -> Result<RiderId> {
    caller
        .as_rider()
        .ok_or_else(|| DispatchError::Forbidden("only riders can do this".into()))
}

/// Who may move a ride to `target`.
fn authorize(caller: &Caller, ride: &Ride, target: RideStatus) -> Result<()> {
    let is_passenger = caller.as_passenger() == Some(ride.passenger_id);
    let is_bound_rider = caller.as_rider().is_some() && caller.as_rider() == ride.rider_id;

    let allowed = match (caller.role, target) {
        (ActorRole::System, _) => true,
        (_, RideStatus::Cancelled) => is_passenger || is_bound_rider,
        (ActorRole::Rider, RideStatus::Arrived | RideStatus::InProgress | RideStatus::Completed) => {
            is_bound_rider
        }
        _ => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(DispatchError::Forbidden(format!(
            "{:?} {} may not move ride {} to {target}",
            caller.role, caller.user_id, ride.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ride::fixtures::requested_ride;
    use crate::ride::PassengerId;

    #[test]
    fn only_bound_rider_advances_trip() {
        let mut ride = requested_ride();
        let rider = RiderId::new();
        ride.rider_id = Some(rider);

        assert!(authorize(&Caller::rider(rider), &ride, RideStatus::Arrived).is_ok());
        assert!(authorize(&Caller::rider(RiderId::new()), &ride, RideStatus::Arrived).is_err());
        assert!(
            authorize(&Caller::passenger(ride.passenger_id), &ride, RideStatus::Completed).is_err()
        );
        assert!(authorize(&Caller::system(), &ride, RideStatus::Completed).is_ok());
    }

    #[test]
    fn cancel_allowed_for_owner_and_bound_rider() {
        let mut ride = requested_ride();
        let rider = RiderId::new();

        assert!(authorize(&Caller::passenger(ride.passenger_id), &ride, RideStatus::Cancelled).is_ok());
        assert!(
            authorize(&Caller::passenger(PassengerId::new()), &ride, RideStatus::Cancelled).is_err()
        );
        // Unbound rider cannot cancel an open request.
        assert!(authorize(&Caller::rider(rider), &ride, RideStatus::Cancelled).is_err());

        ride.rider_id = Some(rider);
        assert!(authorize(&Caller::rider(rider), &ride, RideStatus::Cancelled).is_ok());
    }
}
