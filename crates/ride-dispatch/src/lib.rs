//! # Ride Dispatch
//!
//! The consistency core of a two-sided ride-hailing backend: ride lifecycle,
//! rider acceptance, and synchronization between the passenger-side and
//! rider-side copies of every ride.
//!
//! ## Core Concepts
//!
//! Each ride lives in two stores. One copy is the **origin** (authoritative,
//! fixed when the ride is created), the other is the **mirror** (a read
//! replica that converges to the origin).
//!
//! The key principle: **every write is a conditional update on the origin**.
//! A write names the version it read; if the record moved on, the write
//! loses and nothing is changed.
//!
//! ## Architecture
//!
//! ```text
//! Request handler
//!     │
//!     ▼
//! DispatchService
//!     │
//!     ├─► accept_ride ──► AcceptanceArbiter ──┐
//!     │                                       │
//!     ├─► advance_status / cancel_ride ───────┤ conditional_update
//!     │       (transition table gate)         │ (origin, version + 1)
//!     │                                       ▼
//!     │                                 Origin store
//!     │                                       │
//!     │         ┌─────────────────────────────┘
//!     │         ▼
//!     │   EventBus.emit(RideEvent)
//!     │         │
//!     │         ▼
//!     │   Synchronizer ──► mirror store (inline attempt)
//!     │         │
//!     │         └─► on failure ──► PropagationQueue
//!     │                                 │
//!     │                     SyncWorker ─┤ (backoff, bounded attempts)
//!     │                                 │
//!     │                                 └─► dead letter
//!     │                                         │
//!     └── list_available_rides                  ▼
//!         (MatchingCoordinator)      ReconciliationSweeper
//!                                    (dead letters + window scan)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Single winner** - At most one rider is ever bound to a ride
//! 2. **Forward only** - Status only moves along the transition table
//! 3. **Monotonic versions** - Origin versions increase by exactly one per write
//! 4. **Mirror never regresses** - A mirror write carries the origin version and
//!    never replaces a newer one
//! 5. **Bounded convergence** - Every origin write reaches the mirror within the
//!    retry window plus one sweep interval, or is surfaced as a dead letter
//!
//! ## Guarantees
//!
//! - **At-most-once events**: [`RideEvent`]s are in-memory; slow subscribers
//!   may miss them. Read ride state from the stores for anything durable.
//! - **Idempotent propagation**: keyed by `(ride_id, version)`, so retries,
//!   sweeps and duplicate deliveries converge to the same mirror.
//! - **Non-blocking writes**: callers get their answer once the origin write
//!   lands; mirroring never delays or fails the request.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ride_dispatch::{Caller, DispatchConfig, DispatchEngine, RideStatus, RideStores};
//!
//! let engine = DispatchEngine::builder(RideStores::in_memory(), Arc::new(my_geo_index))
//!     .with_config(DispatchConfig::from_env()?)
//!     .build()?;
//! let handle = engine.start();
//! let dispatch = handle.service();
//!
//! let ride = dispatch.request_ride(&Caller::passenger(passenger_id), request).await?;
//! let ride = dispatch.accept_ride(ride.id, &Caller::rider(rider_id)).await?;
//! let ride = dispatch
//!     .advance_status(ride.id, &Caller::rider(rider_id), RideStatus::Arrived, Some(ride.version))
//!     .await?;
//!
//! handle.shutdown().await;
//! ```
//!
//! ## What This Is Not
//!
//! Ride dispatch does **not**:
//! - Price rides or take payments
//! - Index rider locations (see [`GeoIndex`])
//! - Authenticate callers (see [`Caller`])
//! - Deliver push notifications (subscribe to the [`EventBus`] instead)

// Core modules
mod id_macro;

pub mod arbiter;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod matching;
pub mod queue;
pub mod ride;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod sync;
pub mod transition;
pub mod worker;

// Re-export domain types
pub use ride::{
    Cancellation, Fare, GeoPoint, Location, PassengerId, PaymentMethod, Ride, RideId, RidePatch,
    RideStatus, RideSummary, RiderId, Side, VersionStep,
};

// Re-export collaborator seams
pub use collab::{ActorRole, Caller, FareQuote, GeoIndex, Nearby, RideRequest};

// Re-export error types
pub use error::{DispatchError, Result, StoreError};

// Re-export store types
pub use store::{MemoryRideStore, RideStore, RideStores, ScanCursor, UpdateOutcome};

// Re-export propagation types
pub use queue::{
    ClaimedPropagation, EntryStatus, FailureDisposition, FailureKind, MemoryPropagationQueue,
    NewPropagation, PropagationQueue, QueueStats,
};
pub use sync::{OriginChange, PropagationOutcome, Synchronizer};
pub use sweeper::{ReconciliationSweeper, SweepReport};
pub use worker::{SyncWorker, WorkerReport};

// Re-export coordination types
pub use arbiter::{AcceptOutcome, AcceptanceArbiter};
pub use matching::MatchingCoordinator;
pub use service::DispatchService;
pub use transition::{IllegalTransition, Transition};

// Re-export event types
pub use events::{EventBus, RecordCopy, RideEvent};

// Re-export configuration
pub use config::{BackoffPolicy, DispatchConfig, MatchingConfig, SweeperConfig, WorkerConfig};

// Re-export engine types (primary entry point)
pub use engine::{DispatchEngine, DispatchEngineBuilder, DispatchHandle};

// Re-export commonly used external types
pub use async_trait::async_trait;
