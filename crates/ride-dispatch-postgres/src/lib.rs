//! PostgreSQL ride stores and propagation queue for ride-dispatch.
//!
//! This crate provides production implementations of the `RideStore` and
//! `PropagationQueue` traits from ride-dispatch.
//!
//! # Features
//!
//! - One table per side; conditional updates under a row lock
//! - Propagation claims with `FOR UPDATE SKIP LOCKED`
//! - Exponential backoff retry logic driven by [`BackoffPolicy`]
//! - Dead letters handed to the reconciliation sweeper
//! - Lease reclaim for workers that died mid-propagation
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE passenger_rides (
//!     id UUID PRIMARY KEY,
//!     passenger_id UUID NOT NULL,
//!     rider_id UUID,
//!     pickup JSONB NOT NULL,
//!     destination JSONB NOT NULL,
//!     fare JSONB NOT NULL,
//!     payment_method TEXT NOT NULL,
//!     status TEXT NOT NULL,
//!     request_time TIMESTAMPTZ NOT NULL,
//!     matched_at TIMESTAMPTZ,
//!     start_time TIMESTAMPTZ,
//!     end_time TIMESTAMPTZ,
//!     updated_at TIMESTAMPTZ NOT NULL,
//!     version BIGINT NOT NULL,
//!     origin_side TEXT NOT NULL,
//!     cancellation JSONB
//! );
//! CREATE INDEX idx_passenger_rides_touched ON passenger_rides (origin_side, updated_at, id);
//!
//! -- rider_rides: identical to passenger_rides
//!
//! CREATE TABLE ride_propagations (
//!     id UUID PRIMARY KEY,
//!     ride_id UUID NOT NULL,
//!     origin_side TEXT NOT NULL,
//!     target_version BIGINT NOT NULL,
//!
//!     -- Execution
//!     status TEXT NOT NULL DEFAULT 'pending',
//!     attempt INTEGER NOT NULL DEFAULT 2,
//!     run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     -- Worker tracking
//!     worker_id TEXT,
//!     lease_expires_at TIMESTAMPTZ,
//!
//!     -- Error tracking
//!     last_error TEXT,
//!     error_kind TEXT,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX idx_ride_propagations_ready ON ride_propagations (run_at)
//!     WHERE status = 'pending';
//! CREATE INDEX idx_ride_propagations_lease ON ride_propagations (lease_expires_at)
//!     WHERE status IN ('running', 'reconciling');
//! CREATE INDEX idx_ride_propagations_dead ON ride_propagations (updated_at)
//!     WHERE status = 'dead_letter';
//! ```
//!
//! [`ensure_schema`] creates all of the above if missing.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ride_dispatch::{DispatchConfig, DispatchEngine};
//! use ride_dispatch_postgres::{ensure_schema, PgPropagationQueue, PgRideStore};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/dispatch").await?;
//! ensure_schema(&pool).await?;
//!
//! let config = DispatchConfig::from_env()?;
//! let engine = DispatchEngine::builder(PgRideStore::pair(pool.clone()), geo)
//!     .with_queue(Arc::new(PgPropagationQueue::new(pool, config.backoff)))
//!     .with_config(config)
//!     .build()?;
//! ```

mod queue;
mod store;

pub use queue::PgPropagationQueue;
pub use store::PgRideStore;

use ride_dispatch::{BackoffPolicy, StoreError};
use sqlx::PgPool;

const RIDE_TABLE_COLUMNS: &str = r#"
    id UUID PRIMARY KEY,
    passenger_id UUID NOT NULL,
    rider_id UUID,
    pickup JSONB NOT NULL,
    destination JSONB NOT NULL,
    fare JSONB NOT NULL,
    payment_method TEXT NOT NULL,
    status TEXT NOT NULL,
    request_time TIMESTAMPTZ NOT NULL,
    matched_at TIMESTAMPTZ,
    start_time TIMESTAMPTZ,
    end_time TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL,
    version BIGINT NOT NULL,
    origin_side TEXT NOT NULL,
    cancellation JSONB
"#;

const PROPAGATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ride_propagations (
    id UUID PRIMARY KEY,
    ride_id UUID NOT NULL,
    origin_side TEXT NOT NULL,
    target_version BIGINT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    attempt INTEGER NOT NULL DEFAULT 2,
    run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    worker_id TEXT,
    lease_expires_at TIMESTAMPTZ,
    last_error TEXT,
    error_kind TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_ride_propagations_ready ON ride_propagations (run_at)
    WHERE status = 'pending';
CREATE INDEX IF NOT EXISTS idx_ride_propagations_lease ON ride_propagations (lease_expires_at)
    WHERE status IN ('running', 'reconciling');
CREATE INDEX IF NOT EXISTS idx_ride_propagations_dead ON ride_propagations (updated_at)
    WHERE status = 'dead_letter';
"#;

/// DDL for both ride tables and the propagation queue.
pub fn schema() -> String {
    let mut ddl = String::new();
    for table in [store::PASSENGER_TABLE, store::RIDER_TABLE] {
        ddl.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} ({RIDE_TABLE_COLUMNS});\n\
             CREATE INDEX IF NOT EXISTS idx_{table}_touched ON {table} (origin_side, updated_at, id);\n"
        ));
    }
    ddl.push_str(PROPAGATION_TABLE);
    ddl
}

/// Create the ride tables and propagation queue if they do not exist.
///
/// # Errors
///
/// Returns an error if any DDL statement fails.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::raw_sql(&schema()).execute(pool).await?;
    tracing::info!("ride dispatch schema ensured");
    Ok(())
}

/// Classify a driver error for the synchronizer's retry decision.
pub(crate) fn store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
        other => StoreError::Backend(other.into()),
    }
}

/// Retry schedule used when none is supplied.
pub(crate) fn default_backoff() -> BackoffPolicy {
    BackoffPolicy::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_covers_both_sides_and_queue() {
        let ddl = schema();
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS passenger_rides"));
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS rider_rides"));
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS ride_propagations"));
        assert!(ddl.contains("idx_rider_rides_touched"));
    }

    #[test]
    fn connection_failures_are_transient() {
        assert!(store_error(sqlx::Error::PoolTimedOut).is_transient());
        assert!(store_error(sqlx::Error::PoolClosed).is_transient());
        assert!(!store_error(sqlx::Error::RowNotFound).is_transient());
    }
}
