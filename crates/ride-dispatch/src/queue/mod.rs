//! Pending mirror propagations.
//!
//! When a propagation cannot be applied inline, the synchronizer records it
//! here and a [`SyncWorker`](crate::worker::SyncWorker) retries it on the
//! backoff schedule. Entries that exhaust their attempts become dead letters
//! that the [`ReconciliationSweeper`](crate::sweeper::ReconciliationSweeper)
//! claims and repairs.
//!
//! ## Entry lifecycle
//!
//! ```text
//! enqueue ──► pending ──claim_due──► running ──mark_succeeded──► succeeded
//!               ▲                       │
//!               └──── mark_failed ──────┤ (retryable, attempts left)
//!                                       ▼
//!                                  dead_letter ──claim_dead_letters──► reconciling
//!                                       ▲                                  │
//!                                       └──── mark_failed / lease expiry ──┘
//! ```
//!
//! Both `running` and `reconciling` entries are leased. A worker or sweep
//! that dies (or is cancelled by its timeout) before reporting back leaves
//! an expired lease, and [`PropagationQueue::reclaim_expired`] returns the
//! entry to the state it was claimed from.
//!
//! Entries carry only the ride id, origin side and target version. The
//! worker re-reads the origin when it runs, so a queued entry never replays
//! stale data.
//!
//! Production deployments need a durable implementation (the Postgres queue
//! in `ride-dispatch-postgres`) so a restart does not lose pending work.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ride::{RideId, Side};

pub use memory::MemoryPropagationQueue;

/// Failure classification for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// May succeed later (store unavailable, timeout).
    Retryable,
    /// Will not succeed by retrying; dead-letter immediately.
    NonRetryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Running,
    Succeeded,
    DeadLetter,
    Reconciling,
}

impl EntryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Running => "running",
            EntryStatus::Succeeded => "succeeded",
            EntryStatus::DeadLetter => "dead_letter",
            EntryStatus::Reconciling => "reconciling",
        }
    }
}

/// A propagation to record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPropagation {
    pub ride_id: RideId,
    pub origin_side: Side,
    pub target_version: u64,
    /// Attempt number the next execution will be.
    pub attempt: u32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// A propagation handed to a worker or the sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedPropagation {
    pub id: Uuid,
    pub ride_id: RideId,
    pub origin_side: Side,
    pub target_version: u64,
    pub attempt: u32,
}

/// What `mark_failed` did with the entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Rescheduled { run_at: DateTime<Utc> },
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub dead_letter: i64,
    pub reconciling: i64,
}

/// Storage for pending propagations.
#[async_trait]
pub trait PropagationQueue: Send + Sync {
    /// Record a propagation to retry at `run_at`.
    async fn enqueue(&self, entry: NewPropagation) -> anyhow::Result<Uuid>;

    /// Record a propagation that is already out of attempts.
    async fn dead_letter(&self, entry: NewPropagation) -> anyhow::Result<Uuid>;

    /// Claim up to `limit` pending entries with `run_at <= now`.
    ///
    /// Claimed entries are leased to `worker_id`; entries whose lease
    /// expires are returned to pending by [`reclaim_expired`](Self::reclaim_expired).
    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<ClaimedPropagation>>;

    async fn mark_succeeded(&self, id: Uuid) -> anyhow::Result<()>;

    /// Record a failed attempt.
    ///
    /// Retryable failures with attempts left are rescheduled with
    /// exponential backoff; everything else becomes a dead letter.
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> anyhow::Result<FailureDisposition>;

    /// Claim up to `limit` dead letters for reconciliation, leased from `now`.
    async fn claim_dead_letters(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> anyhow::Result<Vec<ClaimedPropagation>>;

    /// Release entries whose lease expired before `now`.
    ///
    /// `running` entries go back to `pending`, `reconciling` entries back to
    /// `dead_letter`. Returns how many were released.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn stats(&self) -> anyhow::Result<QueueStats>;
}
