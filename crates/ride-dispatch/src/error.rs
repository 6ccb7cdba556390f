//! Error types for dispatch operations.
//!
//! Contention (`AlreadyTaken`, `VersionConflict`) is an expected outcome
//! under concurrency and is reported like any other negative answer. Store
//! failures carry a transient/permanent classification that the
//! synchronizer uses to decide between retrying and dead-lettering.

use crate::ride::{RideId, RideStatus};

/// The result type used throughout ride-dispatch.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Failures reported by a `RideStore` implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend unreachable (connection refused, pool exhausted, partition).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its budget.
    #[error("store call timed out after {millis}ms")]
    Timeout { millis: u64 },

    /// `create` found an existing record with the same id.
    #[error("ride {0} already exists")]
    AlreadyExists(RideId),

    /// A stored record could not be decoded.
    #[error("corrupt ride record {ride_id}: {message}")]
    Corrupt { ride_id: RideId, message: String },

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout { .. })
    }
}

/// Errors surfaced by the dispatch API.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("ride not found: {0}")]
    NotFound(RideId),

    /// Another rider won the ride, or it is no longer open.
    #[error("ride {0} is already taken")]
    AlreadyTaken(RideId),

    /// The requested status change is not in the transition table.
    ///
    /// `from` is the canonical current status so clients can resynchronize.
    #[error("illegal transition for ride {ride_id}: {from} -> {to}")]
    IllegalTransition {
        ride_id: RideId,
        from: RideStatus,
        to: RideStatus,
    },

    /// The caller's view of the ride is stale.
    #[error("version conflict on ride {ride_id}: expected {expected}, found {actual}")]
    VersionConflict {
        ride_id: RideId,
        expected: u64,
        actual: u64,
    },

    /// The stored record violates a ride invariant.
    #[error("ride {ride_id} is in an illegal state: {message}")]
    IllegalState { ride_id: RideId, message: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An external collaborator (geospatial index, fare service) failed.
    #[error("{collaborator} unavailable: {source}")]
    Collaborator {
        collaborator: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    /// Expected negative outcomes under concurrent access.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            DispatchError::AlreadyTaken(_) | DispatchError::VersionConflict { .. }
        )
    }

    /// The canonical status carried by an illegal-transition error.
    pub fn current_status(&self) -> Option<RideStatus> {
        match self {
            DispatchError::IllegalTransition { from, .. } => Some(*from),
            _ => None,
        }
    }
}
