use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ride_dispatch::{
    Cancellation, Fare, Location, PassengerId, PaymentMethod, Ride, RideId, RidePatch,
    RideStatus, RideStore, RideStores, RiderId, ScanCursor, Side, StoreError, UpdateOutcome,
    VersionStep,
};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::debug;

use crate::store_error;

pub(crate) const PASSENGER_TABLE: &str = "passenger_rides";
pub(crate) const RIDER_TABLE: &str = "rider_rides";

const COLUMNS: &str = "id, passenger_id, rider_id, pickup, destination, fare, payment_method, \
     status, request_time, matched_at, start_time, end_time, updated_at, version, origin_side, \
     cancellation";

/// PostgreSQL store for one side's copy of every ride.
#[derive(Clone)]
pub struct PgRideStore {
    pool: PgPool,
    table: &'static str,
}

impl PgRideStore {
    pub fn new(pool: PgPool, side: Side) -> Self {
        let table = match side {
            Side::Passenger => PASSENGER_TABLE,
            Side::Rider => RIDER_TABLE,
        };
        Self { pool, table }
    }

    /// Both sides backed by the same pool.
    ///
    /// Production deployments that keep the sides in separate databases
    /// build each store from its own pool and use [`RideStores::new`].
    pub fn pair(pool: PgPool) -> RideStores {
        RideStores::new(
            Arc::new(Self::new(pool.clone(), Side::Passenger)),
            Arc::new(Self::new(pool, Side::Rider)),
        )
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &'static str {
        self.table
    }
}

#[async_trait]
impl RideStore for PgRideStore {
    async fn get(&self, id: RideId) -> Result<Option<Ride>, StoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM {} WHERE id = $1", self.table))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

        row.as_ref().map(decode_ride).transpose()
    }

    async fn create(&self, ride: &Ride) -> Result<Ride, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO NOTHING
            "#,
            self.table
        ))
        .bind(ride.id.as_uuid())
        .bind(ride.passenger_id.as_uuid())
        .bind(ride.rider_id.map(|id| id.as_uuid()))
        .bind(Json(&ride.pickup))
        .bind(Json(&ride.destination))
        .bind(Json(&ride.fare))
        .bind(payment_method_str(ride.payment_method))
        .bind(ride.status.as_str())
        .bind(ride.request_time)
        .bind(ride.matched_at)
        .bind(ride.start_time)
        .bind(ride.end_time)
        .bind(ride.updated_at)
        .bind(to_db_version(ride.id, ride.version)?)
        .bind(ride.origin_side.as_str())
        .bind(ride.cancellation.as_ref().map(Json))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists(ride.id));
        }
        Ok(ride.clone())
    }

    /// Compare-and-swap under a row lock.
    ///
    /// The version check and the write happen in one transaction holding
    /// `FOR UPDATE` on the row, so concurrent writers serialize in Postgres.
    async fn conditional_update(
        &self,
        id: RideId,
        expected_version: u64,
        patch: &RidePatch,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE id = $1 FOR UPDATE",
            self.table
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;

        let Some(row) = row else {
            return Ok(UpdateOutcome::NotFound);
        };
        let mut ride = decode_ride(&row)?;

        if ride.version != expected_version {
            debug!(ride_id = %id, table = self.table, expected_version, actual = ride.version, "conditional update lost");
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

        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = $2,
                rider_id = $3,
                matched_at = $4,
                start_time = $5,
                end_time = $6,
                cancellation = $7,
                version = $8,
                updated_at = $9
            WHERE id = $1
            "#,
            self.table
        ))
        .bind(id.as_uuid())
        .bind(ride.status.as_str())
        .bind(ride.rider_id.map(|rider| rider.as_uuid()))
        .bind(ride.matched_at)
        .bind(ride.start_time)
        .bind(ride.end_time)
        .bind(ride.cancellation.as_ref().map(Json))
        .bind(to_db_version(id, ride.version)?)
        .bind(ride.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;
        Ok(UpdateOutcome::Updated(ride))
    }

    async fn origins_touched_since(
        &self,
        origin_side: Side,
        since: DateTime<Utc>,
        after: Option<ScanCursor>,
        limit: usize,
    ) -> Result<Vec<Ride>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS}
            FROM {}
            WHERE origin_side = $1
              AND updated_at >= $2
              AND ($3::timestamptz IS NULL OR (updated_at, id) > ($3, $4::uuid))
            ORDER BY updated_at ASC, id ASC
            LIMIT $5
            "#,
            self.table
        ))
        .bind(origin_side.as_str())
        .bind(since)
        .bind(after.map(|cursor| cursor.updated_at))
        .bind(after.map(|cursor| cursor.id.as_uuid()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.iter().map(decode_ride).collect()
    }
}

fn decode_ride(row: &PgRow) -> Result<Ride, StoreError> {
    let ride_id = RideId::from_uuid(
        row.try_get("id")
            .map_err(|err| StoreError::Backend(err.into()))?,
    );
    let corrupt = |message: String| StoreError::Corrupt { ride_id, message };
    let column = |err: sqlx::Error| corrupt(err.to_string());

    let status: String = row.try_get("status").map_err(column)?;
    let payment_method: String = row.try_get("payment_method").map_err(column)?;
    let origin_side: String = row.try_get("origin_side").map_err(column)?;
    let version: i64 = row.try_get("version").map_err(column)?;
    let pickup: Json<Location> = row.try_get("pickup").map_err(column)?;
    let destination: Json<Location> = row.try_get("destination").map_err(column)?;
    let fare: Json<Fare> = row.try_get("fare").map_err(column)?;
    let cancellation: Option<Json<Cancellation>> = row.try_get("cancellation").map_err(column)?;

    Ok(Ride {
        id: ride_id,
        passenger_id: PassengerId::from_uuid(row.try_get("passenger_id").map_err(column)?),
        rider_id: row
            .try_get::<Option<uuid::Uuid>, _>("rider_id")
            .map_err(column)?
            .map(RiderId::from_uuid),
        pickup: pickup.0,
        destination: destination.0,
        fare: fare.0,
        payment_method: parse_payment_method(&payment_method).ok_or_else(|| {
            corrupt(format!("unknown payment method {payment_method:?}"))
        })?,
        status: status
            .parse::<RideStatus>()
            .map_err(|err| corrupt(err.to_string()))?,
        request_time: row.try_get("request_time").map_err(column)?,
        matched_at: row.try_get("matched_at").map_err(column)?,
        start_time: row.try_get("start_time").map_err(column)?,
        end_time: row.try_get("end_time").map_err(column)?,
        updated_at: row.try_get("updated_at").map_err(column)?,
        version: u64::try_from(version).map_err(|_| corrupt(format!("negative version {version}")))?,
        origin_side: parse_side(&origin_side)
            .ok_or_else(|| corrupt(format!("unknown origin side {origin_side:?}")))?,
        cancellation: cancellation.map(|c| c.0),
    })
}

fn to_db_version(ride_id: RideId, version: u64) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Corrupt {
        ride_id,
        message: format!("version {version} exceeds BIGINT"),
    })
}

fn payment_method_str(method: PaymentMethod) -> &'static str {
    match method {
        PaymentMethod::Cash => "cash",
        PaymentMethod::Card => "card",
        PaymentMethod::Wallet => "wallet",
    }
}

fn parse_payment_method(s: &str) -> Option<PaymentMethod> {
    match s {
        "cash" => Some(PaymentMethod::Cash),
        "card" => Some(PaymentMethod::Card),
        "wallet" => Some(PaymentMethod::Wallet),
        _ => None,
    }
}

pub(crate) fn parse_side(s: &str) -> Option<Side> {
    match s {
        "passenger" => Some(Side::Passenger),
        "rider" => Some(Side::Rider),
        _ => None,
    }
}
