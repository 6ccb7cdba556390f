//! Origin → mirror propagation.
//!
//! After every successful origin write, the new snapshot is pushed to the
//! mirror store. Propagation is keyed by `(ride_id, version)`: the mirror
//! adopts the origin's version, so a change whose version is not ahead of
//! the mirror's is a replay and is dropped.
//!
//! ```text
//! origin write ok
//!     │
//!     ▼ spawn_propagate()          (caller does not wait)
//! apply to mirror ── ok ──► Mirrored / Duplicate ──► RideEvent(Mirror)
//!     │
//!     └─ transient failure, attempts left ──► queue.enqueue(run_at = now + backoff) ──► Deferred
//!     └─ otherwise ──────────────────────────► queue.dead_letter() ─────────────────► PermanentFailure
//! ```
//!
//! A failed propagation never touches the origin. The origin stays the
//! source of truth and the mirror is allowed to lag.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BackoffPolicy;
use crate::error::StoreError;
use crate::events::{EventBus, RecordCopy, RideEvent};
use crate::queue::{NewPropagation, PropagationQueue};
use crate::ride::{Ride, RideId, RidePatch, Side};
use crate::store::{timed, RideStores, UpdateOutcome};

/// Mirror CAS attempts per propagation before treating the mirror as contended.
const MIRROR_CAS_ATTEMPTS: usize = 2;

/// The origin snapshot produced by a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginChange {
    pub ride: Ride,
}

impl OriginChange {
    pub fn new(ride: Ride) -> Self {
        Self { ride }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropagationOutcome {
    /// The mirror now reflects `version`.
    Mirrored { version: u64 },
    /// The mirror already had `version` or newer; nothing written.
    Duplicate { version: u64 },
    /// Recorded for retry.
    Deferred { reason: String },
    /// Out of attempts or not retryable; handed to the sweeper.
    PermanentFailure { reason: String },
}

impl PropagationOutcome {
    /// Whether the mirror is known to be caught up.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Mirrored { .. } | Self::Duplicate { .. })
    }
}

pub struct Synchronizer {
    stores: RideStores,
    queue: Arc<dyn PropagationQueue>,
    bus: EventBus,
    backoff: BackoffPolicy,
    store_timeout: Duration,
}

impl Synchronizer {
    pub fn new(
        stores: RideStores,
        queue: Arc<dyn PropagationQueue>,
        bus: EventBus,
        backoff: BackoffPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            stores,
            queue,
            bus,
            backoff,
            store_timeout,
        }
    }

    pub fn queue(&self) -> &Arc<dyn PropagationQueue> {
        &self.queue
    }

    /// Propagate in the background; the returned handle is optional to await.
    pub fn spawn_propagate(self: &Arc<Self>, change: OriginChange) -> JoinHandle<PropagationOutcome> {
        let sync = Arc::clone(self);
        tokio::spawn(async move {
            let ride_id = change.ride.id;
            sync.propagate(ride_id, &change).await
        })
    }

    /// First, inline attempt at mirroring an origin change.
    pub async fn propagate(&self, ride_id: RideId, change: &OriginChange) -> PropagationOutcome {
        debug_assert_eq!(ride_id, change.ride.id);
        match self.apply(&change.ride).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.defer_or_fail(ride_id, change.ride.origin_side, change.ride.version, 1, &err)
                    .await
            }
        }
    }

    /// Re-read the origin and mirror its current state.
    ///
    /// Used by the retry worker and the sweeper. If the origin has moved past
    /// `target_version`, the newer snapshot is propagated instead.
    ///
    /// # Errors
    ///
    /// Store failures, or [`StoreError::Corrupt`] when the origin record is
    /// missing or behind the version it was supposed to have reached.
    pub async fn propagate_latest(
        &self,
        ride_id: RideId,
        origin_side: Side,
        target_version: u64,
    ) -> Result<PropagationOutcome, StoreError> {
        let origin = timed(self.store_timeout, self.stores.origin(origin_side).get(ride_id))
            .await?
            .ok_or_else(|| StoreError::Corrupt {
                ride_id,
                message: format!("origin record missing on {origin_side} side"),
            })?;

        if origin.version < target_version {
            return Err(StoreError::Corrupt {
                ride_id,
                message: format!(
                    "origin at version {} is behind propagated version {target_version}",
                    origin.version
                ),
            });
        }

        self.apply(&origin).await
    }

    /// Record a failed attempt: queue a retry or dead-letter it.
    pub(crate) async fn defer_or_fail(
        &self,
        ride_id: RideId,
        origin_side: Side,
        target_version: u64,
        attempt: u32,
        err: &StoreError,
    ) -> PropagationOutcome {
        let reason = err.to_string();

        if err.is_transient() && self.backoff.allows_retry_after(attempt) {
            let delay = self.backoff.delay_after(attempt);
            let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            let entry = NewPropagation {
                ride_id,
                origin_side,
                target_version,
                attempt: attempt + 1,
                run_at,
                last_error: Some(reason.clone()),
            };
            match self.queue.enqueue(entry).await {
                Ok(_) => {
                    warn!(
                        %ride_id,
                        version = target_version,
                        attempt,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "mirror propagation deferred"
                    );
                    return PropagationOutcome::Deferred { reason };
                }
                Err(queue_err) => {
                    error!(
                        %ride_id,
                        version = target_version,
                        error = %queue_err,
                        "could not enqueue propagation retry; sweeper window scan will repair"
                    );
                    return PropagationOutcome::PermanentFailure { reason };
                }
            }
        }

        error!(
            %ride_id,
            version = target_version,
            attempt,
            error = %err,
            "mirror propagation failed permanently; handing to sweeper"
        );
        let entry = NewPropagation {
            ride_id,
            origin_side,
            target_version,
            attempt,
            run_at: Utc::now(),
            last_error: Some(reason.clone()),
        };
        if let Err(queue_err) = self.queue.dead_letter(entry).await {
            error!(%ride_id, error = %queue_err, "could not record dead letter");
        }
        PropagationOutcome::PermanentFailure { reason }
    }

    /// Bring the mirror up to `origin`, idempotently.
    async fn apply(&self, origin: &Ride) -> Result<PropagationOutcome, StoreError> {
        let mirror_store = self.stores.mirror(origin.origin_side);

        for _ in 0..MIRROR_CAS_ATTEMPTS {
            let mirror = timed(self.store_timeout, mirror_store.get(origin.id)).await?;

            let written = match mirror {
                None => match timed(self.store_timeout, mirror_store.create(origin)).await {
                    Ok(created) => Some(created),
                    Err(StoreError::AlreadyExists(_)) => None,
                    Err(err) => return Err(err),
                },
                Some(mirror) if mirror.version >= origin.version => {
                    debug!(
                        ride_id = %origin.id,
                        version = origin.version,
                        mirror_version = mirror.version,
                        "propagation already applied"
                    );
                    return Ok(PropagationOutcome::Duplicate {
                        version: mirror.version,
                    });
                }
                Some(mirror) => {
                    let patch = RidePatch::mirror_of(origin);
                    match timed(
                        self.store_timeout,
                        mirror_store.conditional_update(origin.id, mirror.version, &patch),
                    )
                    .await?
                    {
                        UpdateOutcome::Updated(updated) => Some(updated),
                        UpdateOutcome::VersionConflict { .. } | UpdateOutcome::NotFound => None,
                    }
                }
            };

            if let Some(mirrored) = written {
                info!(
                    ride_id = %mirrored.id,
                    version = mirrored.version,
                    status = %mirrored.status,
                    "mirror updated"
                );
                self.bus.emit(RideEvent::from_ride(&mirrored, RecordCopy::Mirror));
                return Ok(PropagationOutcome::Mirrored {
                    version: mirrored.version,
                });
            }
        }

        Err(StoreError::Unavailable(format!(
            "mirror for ride {} changed concurrently",
            origin.id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryPropagationQueue;
    use crate::ride::fixtures::requested_ride;
    use crate::ride::{RideStatus, RiderId};

    fn synchronizer(stores: RideStores) -> (Synchronizer, Arc<MemoryPropagationQueue>) {
        let queue = Arc::new(MemoryPropagationQueue::default());
        let sync = Synchronizer::new(
            stores,
            queue.clone(),
            EventBus::new(),
            BackoffPolicy::default(),
            Duration::from_secs(1),
        );
        (sync, queue)
    }

    #[tokio::test]
    async fn first_propagation_creates_mirror() {
        let stores = RideStores::in_memory();
        let ride = stores.origin(Side::Passenger).create(&requested_ride()).await.unwrap();
        let (sync, _) = synchronizer(stores.clone());

        let outcome = sync.propagate(ride.id, &OriginChange::new(ride.clone())).await;

        assert_eq!(outcome, PropagationOutcome::Mirrored { version: 1 });
        let mirror = stores.mirror(Side::Passenger).get(ride.id).await.unwrap().unwrap();
        assert_eq!(mirror.sync_key(), ride.sync_key());
    }

    #[tokio::test]
    async fn replayed_version_is_a_no_op() {
        let stores = RideStores::in_memory();
        let origin = stores.origin(Side::Passenger);
        let ride = origin.create(&requested_ride()).await.unwrap();
        let (sync, _) = synchronizer(stores.clone());
        sync.propagate(ride.id, &OriginChange::new(ride.clone())).await;

        let patch = RidePatch::transition(RideStatus::Matched, Utc::now()).with_rider(RiderId::new());
        let UpdateOutcome::Updated(matched) =
            origin.conditional_update(ride.id, 1, &patch).await.unwrap()
        else {
            panic!("origin update failed");
        };
        let change = OriginChange::new(matched);

        assert_eq!(
            sync.propagate(ride.id, &change).await,
            PropagationOutcome::Mirrored { version: 2 }
        );
        let before = stores.mirror(Side::Passenger).get(ride.id).await.unwrap().unwrap();

        assert_eq!(
            sync.propagate(ride.id, &change).await,
            PropagationOutcome::Duplicate { version: 2 }
        );
        let after = stores.mirror(Side::Passenger).get(ride.id).await.unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn stale_change_never_regresses_mirror() {
        let stores = RideStores::in_memory();
        let origin = stores.origin(Side::Passenger);
        let created = origin.create(&requested_ride()).await.unwrap();
        let patch = RidePatch::transition(RideStatus::Cancelled, Utc::now());
        let UpdateOutcome::Updated(cancelled) =
            origin.conditional_update(created.id, 1, &patch).await.unwrap()
        else {
            panic!("origin update failed");
        };
        let (sync, _) = synchronizer(stores.clone());

        sync.propagate(created.id, &OriginChange::new(cancelled)).await;
        let outcome = sync.propagate(created.id, &OriginChange::new(created.clone())).await;

        assert_eq!(outcome, PropagationOutcome::Duplicate { version: 2 });
        let mirror = stores.mirror(Side::Passenger).get(created.id).await.unwrap().unwrap();
        assert_eq!(mirror.status, RideStatus::Cancelled);
    }

    #[tokio::test]
    async fn transient_failure_is_deferred_with_backoff() {
        let stores = RideStores::in_memory();
        let (sync, queue) = synchronizer(stores);
        let ride_id = RideId::new();
        let before = Utc::now();

        let outcome = sync
            .defer_or_fail(
                ride_id,
                Side::Passenger,
                3,
                1,
                &StoreError::Unavailable("connection refused".into()),
            )
            .await;

        assert!(matches!(outcome, PropagationOutcome::Deferred { .. }));
        let due = queue
            .claim_due("w", before + chrono::Duration::seconds(2), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempt, 2);
        assert_eq!(due[0].target_version, 3);
    }

    #[tokio::test]
    async fn permanent_error_goes_straight_to_dead_letter() {
        let (sync, queue) = synchronizer(RideStores::in_memory());
        let ride_id = RideId::new();

        let outcome = sync
            .defer_or_fail(
                ride_id,
                Side::Passenger,
                2,
                1,
                &StoreError::Corrupt {
                    ride_id,
                    message: "bad json".into(),
                },
            )
            .await;

        assert!(matches!(outcome, PropagationOutcome::PermanentFailure { .. }));
        assert_eq!(queue.stats().await.unwrap().dead_letter, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_dead_letter() {
        let (sync, queue) = synchronizer(RideStores::in_memory());
        let outcome = sync
            .defer_or_fail(
                RideId::new(),
                Side::Passenger,
                2,
                BackoffPolicy::default().max_attempts,
                &StoreError::Timeout { millis: 10 },
            )
            .await;
        assert!(matches!(outcome, PropagationOutcome::PermanentFailure { .. }));
        assert_eq!(queue.stats().await.unwrap().dead_letter, 1);
    }

    #[tokio::test]
    async fn propagate_latest_uses_current_origin() {
        let stores = RideStores::in_memory();
        let origin = stores.origin(Side::Passenger);
        let ride = origin.create(&requested_ride()).await.unwrap();
        let patch = RidePatch::transition(RideStatus::Cancelled, Utc::now());
        origin.conditional_update(ride.id, 1, &patch).await.unwrap();
        let (sync, _) = synchronizer(stores.clone());

        let outcome = sync.propagate_latest(ride.id, Side::Passenger, 1).await.unwrap();

        assert_eq!(outcome, PropagationOutcome::Mirrored { version: 2 });
    }

    #[tokio::test]
    async fn propagate_latest_rejects_missing_origin() {
        let (sync, _) = synchronizer(RideStores::in_memory());
        let err = sync
            .propagate_latest(RideId::new(), Side::Passenger, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(!err.is_transient());
    }
}
