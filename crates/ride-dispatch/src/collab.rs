//! Interfaces to the collaborators that live outside the dispatch core.
//!
//! Identity comes from the auth layer, distances from the geospatial
//! service, and fares from the pricing service. None of them are
//! implemented here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ride::{Fare, GeoPoint, Location, PassengerId, PaymentMethod, RideId, RiderId};

/// Role of the authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Passenger,
    Rider,
    /// Operators and background jobs.
    System,
}

/// The authenticated identity of whoever invoked an operation.
///
/// Trusted as-is; the core never authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: ActorRole,
}

impl Caller {
    pub fn passenger(id: PassengerId) -> Self {
        Self {
            user_id: id.as_uuid(),
            role: ActorRole::Passenger,
        }
    }

    pub fn rider(id: RiderId) -> Self {
        Self {
            user_id: id.as_uuid(),
            role: ActorRole::Rider,
        }
    }

    pub fn system() -> Self {
        Self {
            user_id: Uuid::nil(),
            role: ActorRole::System,
        }
    }

    pub fn as_passenger(&self) -> Option<PassengerId> {
        (self.role == ActorRole::Passenger).then(|| PassengerId::from_uuid(self.user_id))
    }

    pub fn as_rider(&self) -> Option<RiderId> {
        (self.role == ActorRole::Rider).then(|| RiderId::from_uuid(self.user_id))
    }
}

/// A geospatial hit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Nearby<Id> {
    pub id: Id,
    pub distance_m: f64,
}

/// Geospatial query capability.
///
/// Distance filtering, indexing and presence tracking all happen behind this
/// trait. Results need not be sorted.
#[async_trait]
pub trait GeoIndex: Send + Sync {
    /// Open ride requests whose pickup lies within `radius_m` of `point`.
    async fn nearby_rides(&self, point: GeoPoint, radius_m: f64)
        -> anyhow::Result<Vec<Nearby<RideId>>>;

    /// Online riders within `radius_m` of `point`.
    async fn nearby_riders(
        &self,
        point: GeoPoint,
        radius_m: f64,
    ) -> anyhow::Result<Vec<Nearby<RiderId>>>;

    /// Last reported location of a rider, if they are online.
    async fn rider_location(&self, rider_id: RiderId) -> anyhow::Result<Option<GeoPoint>>;
}

/// Fare and payment method computed upstream before the ride is requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FareQuote {
    pub fare: Fare,
    pub payment_method: PaymentMethod,
}

/// Input to `DispatchService::request_ride`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRequest {
    pub pickup: Location,
    pub destination: Location,
    pub quote: FareQuote,
}
