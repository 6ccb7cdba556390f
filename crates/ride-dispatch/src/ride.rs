//! The ride entity and the patch vocabulary used to mutate it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collab::{ActorRole, FareQuote};
use crate::uuid_id;

uuid_id! {
    /// Stable ride identifier, shared by the origin and mirror copies.
    pub struct RideId;
}

uuid_id! {
    /// Identifies a passenger (ride requester).
    pub struct PassengerId;
}

uuid_id! {
    /// Identifies a rider (driver).
    pub struct RiderId;
}

/// Ride lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Requested,
    Matched,
    Arrived,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub const ALL: [RideStatus; 6] = [
        RideStatus::Requested,
        RideStatus::Matched,
        RideStatus::Arrived,
        RideStatus::InProgress,
        RideStatus::Completed,
        RideStatus::Cancelled,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            RideStatus::Requested => "requested",
            RideStatus::Matched => "matched",
            RideStatus::Arrived => "arrived",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses accept no further transitions.
    pub const fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown status string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown ride status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for RideStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RideStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Which physical store a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Passenger,
    Rider,
}

impl Side {
    /// The store that holds the other copy.
    pub const fn opposite(self) -> Side {
        match self {
            Side::Passenger => Side::Rider,
            Side::Rider => Side::Passenger,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Side::Passenger => "passenger",
            Side::Rider => "rider",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WGS84 coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub point: GeoPoint,
    pub address: String,
}

/// Fare in minor currency units (cents), as quoted by the fare collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fare {
    pub amount_minor: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Wallet,
}

/// Who cancelled a ride and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub by: ActorRole,
    pub actor_id: uuid::Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One physical copy of a ride.
///
/// The origin copy is authoritative. The mirror copy carries the origin's
/// `version` verbatim, so `version` on a mirror names the origin write it
/// reflects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    pub id: RideId,
    pub passenger_id: PassengerId,
    pub rider_id: Option<RiderId>,
    pub pickup: Location,
    pub destination: Location,
    pub fare: Fare,
    pub payment_method: PaymentMethod,
    pub status: RideStatus,
    pub request_time: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
    pub origin_side: Side,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation: Option<Cancellation>,
}

impl Ride {
    /// A freshly requested ride at version 1.
    pub fn requested(
        passenger_id: PassengerId,
        pickup: Location,
        destination: Location,
        quote: FareQuote,
        origin_side: Side,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RideId::new(),
            passenger_id,
            rider_id: None,
            pickup,
            destination,
            fare: quote.fare,
            payment_method: quote.payment_method,
            status: RideStatus::Requested,
            request_time: now,
            matched_at: None,
            start_time: None,
            end_time: None,
            updated_at: now,
            version: 1,
            origin_side,
            cancellation: None,
        }
    }

    /// The fields that must agree between origin and mirror.
    pub fn sync_key(&self) -> (RideStatus, Option<RiderId>, u64) {
        (self.status, self.rider_id, self.version)
    }

    /// Apply a patch as a single accepted write.
    ///
    /// Callers (store adapters) are responsible for checking the expected
    /// version first; this only mutates.
    pub fn apply(&mut self, patch: &RidePatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(rider_id) = patch.rider_id {
            self.rider_id = Some(rider_id);
        }
        if patch.matched_at.is_some() {
            self.matched_at = patch.matched_at;
        }
        if patch.start_time.is_some() {
            self.start_time = patch.start_time;
        }
        if patch.end_time.is_some() {
            self.end_time = patch.end_time;
        }
        if patch.cancellation.is_some() {
            self.cancellation = patch.cancellation.clone();
        }
        self.version = patch.version_step.next(self.version);
        self.updated_at = now;
    }

    pub fn summary(&self, distance_m: f64) -> RideSummary {
        RideSummary {
            ride_id: self.id,
            passenger_id: self.passenger_id,
            pickup: self.pickup.clone(),
            destination: self.destination.clone(),
            fare: self.fare.clone(),
            payment_method: self.payment_method,
            request_time: self.request_time,
            distance_m,
        }
    }
}

/// How a successful write moves the record's version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionStep {
    /// Origin writes: `version + 1`.
    #[default]
    Bump,
    /// Mirror writes: take the origin's version. Must exceed the expected version.
    Adopt(u64),
}

impl VersionStep {
    pub const fn next(self, current: u64) -> u64 {
        match self {
            VersionStep::Bump => current + 1,
            VersionStep::Adopt(version) => version,
        }
    }
}

/// Partial update applied through `RideStore::conditional_update`.
///
/// A rider binding can be set but never cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RidePatch {
    pub status: Option<RideStatus>,
    pub rider_id: Option<RiderId>,
    pub matched_at: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub cancellation: Option<Cancellation>,
    pub version_step: VersionStep,
}

impl RidePatch {
    /// Status change with the timestamp that status implies.
    pub fn transition(target: RideStatus, now: DateTime<Utc>) -> Self {
        let mut patch = Self {
            status: Some(target),
            ..Self::default()
        };
        match target {
            RideStatus::Matched => patch.matched_at = Some(now),
            RideStatus::InProgress => patch.start_time = Some(now),
            RideStatus::Completed | RideStatus::Cancelled => patch.end_time = Some(now),
            RideStatus::Requested | RideStatus::Arrived => {}
        }
        patch
    }

    pub fn with_rider(mut self, rider_id: RiderId) -> Self {
        self.rider_id = Some(rider_id);
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// Everything a mirror needs to catch up with `origin`.
    pub fn mirror_of(origin: &Ride) -> Self {
        Self {
            status: Some(origin.status),
            rider_id: origin.rider_id,
            matched_at: origin.matched_at,
            start_time: origin.start_time,
            end_time: origin.end_time,
            cancellation: origin.cancellation.clone(),
            version_step: VersionStep::Adopt(origin.version),
        }
    }
}

/// What a rider sees when browsing open requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideSummary {
    pub ride_id: RideId,
    pub passenger_id: PassengerId,
    pub pickup: Location,
    pub destination: Location,
    pub fare: Fare,
    pub payment_method: PaymentMethod,
    pub request_time: DateTime<Utc>,
    pub distance_m: f64,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn location(lat: f64, lng: f64) -> Location {
        Location {
            point: GeoPoint::new(lat, lng),
            address: format!("{lat},{lng}"),
        }
    }

    pub fn quote() -> FareQuote {
        FareQuote {
            fare: Fare {
                amount_minor: 1_250,
                currency: "USD".to_string(),
            },
            payment_method: PaymentMethod::Card,
        }
    }

    pub fn requested_ride() -> Ride {
        Ride::requested(
            PassengerId::new(),
            location(40.0, -73.0),
            location(40.1, -73.1),
            quote(),
            Side::Passenger,
            Utc::now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::requested_ride;
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in RideStatus::ALL {
            assert_eq!(status.as_str().parse::<RideStatus>().unwrap(), status);
        }
        assert!("en_route".parse::<RideStatus>().is_err());
    }

    #[test]
    fn apply_bumps_version_and_stamps_updated_at() {
        let mut ride = requested_ride();
        let now = Utc::now() + chrono::Duration::seconds(5);
        let rider = RiderId::new();

        ride.apply(
            &RidePatch::transition(RideStatus::Matched, now).with_rider(rider),
            now,
        );

        assert_eq!(ride.version, 2);
        assert_eq!(ride.updated_at, now);
        assert_eq!(ride.matched_at, Some(now));
        assert_eq!(ride.rider_id, Some(rider));
    }

    #[test]
    fn mirror_patch_adopts_origin_version() {
        let mut origin = requested_ride();
        let rider = RiderId::new();
        let now = Utc::now();
        origin.apply(
            &RidePatch::transition(RideStatus::Matched, now).with_rider(rider),
            now,
        );
        origin.apply(&RidePatch::transition(RideStatus::Arrived, now), now);

        let mut mirror = requested_ride();
        mirror.id = origin.id;
        mirror.apply(&RidePatch::mirror_of(&origin), now);

        assert_eq!(mirror.sync_key(), origin.sync_key());
        assert_eq!(mirror.version, 3);
    }

    #[test]
    fn patch_never_clears_rider() {
        let mut ride = requested_ride();
        let rider = RiderId::new();
        let now = Utc::now();
        ride.apply(&RidePatch::default().with_rider(rider), now);
        ride.apply(&RidePatch::transition(RideStatus::Cancelled, now), now);
        assert_eq!(ride.rider_id, Some(rider));
    }
}
