//! In-memory propagation queue.
//!
//! **Not durable.** Pending work is lost when the process exits, so this is
//! for tests and single-process development only.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    ClaimedPropagation, EntryStatus, FailureDisposition, FailureKind, NewPropagation,
    PropagationQueue, QueueStats,
};
use crate::config::BackoffPolicy;

#[derive(Debug, Clone)]
struct Entry {
    propagation: NewPropagation,
    status: EntryStatus,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn claimed(&self, id: Uuid) -> ClaimedPropagation {
        ClaimedPropagation {
            id,
            ride_id: self.propagation.ride_id,
            origin_side: self.propagation.origin_side,
            target_version: self.propagation.target_version,
            attempt: self.propagation.attempt,
        }
    }
}

#[derive(Debug)]
pub struct MemoryPropagationQueue {
    entries: Mutex<HashMap<Uuid, Entry>>,
    backoff: BackoffPolicy,
    lease: Duration,
}

impl Default for MemoryPropagationQueue {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl MemoryPropagationQueue {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            backoff,
            lease: Duration::from_secs(60),
        }
    }

    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("propagation queue lock poisoned"))
    }

    fn insert(&self, propagation: NewPropagation, status: EntryStatus) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.lock()?.insert(
            id,
            Entry {
                propagation,
                status,
                lease_expires_at: None,
            },
        );
        Ok(id)
    }

    /// Drop succeeded entries. Returns how many were removed.
    pub fn cleanup_succeeded(&self) -> Result<usize> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.status != EntryStatus::Succeeded);
        Ok(before - entries.len())
    }
}

#[async_trait]
impl PropagationQueue for MemoryPropagationQueue {
    async fn enqueue(&self, entry: NewPropagation) -> Result<Uuid> {
        self.insert(entry, EntryStatus::Pending)
    }

    async fn dead_letter(&self, entry: NewPropagation) -> Result<Uuid> {
        self.insert(entry, EntryStatus::DeadLetter)
    }

    async fn claim_due(
        &self,
        _worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedPropagation>> {
        let lease_expires_at = now + chrono::Duration::from_std(self.lease)?;
        let mut entries = self.lock()?;

        let mut due: Vec<(Uuid, DateTime<Utc>)> = entries
            .iter()
            .filter(|(_, e)| e.status == EntryStatus::Pending && e.propagation.run_at <= now)
            .map(|(id, e)| (*id, e.propagation.run_at))
            .collect();
        due.sort_by_key(|(_, run_at)| *run_at);
        due.truncate(limit);

        let mut claimed = Vec::with_capacity(due.len());
        for (id, _) in due {
            if let Some(entry) = entries.get_mut(&id) {
                entry.status = EntryStatus::Running;
                entry.lease_expires_at = Some(lease_expires_at);
                claimed.push(entry.claimed(id));
            }
        }
        Ok(claimed)
    }

    async fn mark_succeeded(&self, id: Uuid) -> Result<()> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| anyhow!("propagation {id} not found"))?;
        entry.status = EntryStatus::Succeeded;
        entry.lease_expires_at = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<FailureDisposition> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| anyhow!("propagation {id} not found"))?;

        entry.propagation.last_error = Some(error.to_string());
        entry.lease_expires_at = None;

        let attempt = entry.propagation.attempt;
        match kind {
            FailureKind::Retryable if self.backoff.allows_retry_after(attempt) => {
                let run_at = Utc::now() + chrono::Duration::from_std(self.backoff.delay_after(attempt))?;
                entry.status = EntryStatus::Pending;
                entry.propagation.attempt = attempt + 1;
                entry.propagation.run_at = run_at;
                Ok(FailureDisposition::Rescheduled { run_at })
            }
            _ => {
                entry.status = EntryStatus::DeadLetter;
                Ok(FailureDisposition::DeadLettered)
            }
        }
    }

    async fn claim_dead_letters(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedPropagation>> {
        let lease_expires_at = now + chrono::Duration::from_std(self.lease)?;
        let mut entries = self.lock()?;
        let mut claimed = Vec::new();
        for (id, entry) in entries.iter_mut() {
            if claimed.len() == limit {
                break;
            }
            if entry.status == EntryStatus::DeadLetter {
                entry.status = EntryStatus::Reconciling;
                entry.lease_expires_at = Some(lease_expires_at);
                claimed.push(entry.claimed(*id));
            }
        }
        Ok(claimed)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.lock()?;
        let mut reclaimed = 0;
        for entry in entries.values_mut() {
            if !entry.lease_expires_at.is_some_and(|at| at < now) {
                continue;
            }
            let released = match entry.status {
                EntryStatus::Running => EntryStatus::Pending,
                EntryStatus::Reconciling => EntryStatus::DeadLetter,
                _ => continue,
            };
            entry.status = released;
            entry.lease_expires_at = None;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let entries = self.lock()?;
        let mut stats = QueueStats::default();
        for entry in entries.values() {
            match entry.status {
                EntryStatus::Pending => stats.pending += 1,
                EntryStatus::Running => stats.running += 1,
                EntryStatus::Succeeded => stats.succeeded += 1,
                EntryStatus::DeadLetter => stats.dead_letter += 1,
                EntryStatus::Reconciling => stats.reconciling += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ride::{RideId, Side};

    fn pending(run_at: DateTime<Utc>) -> NewPropagation {
        NewPropagation {
            ride_id: RideId::new(),
            origin_side: Side::Passenger,
            target_version: 2,
            attempt: 2,
            run_at,
            last_error: Some("store unavailable".into()),
        }
    }

    #[tokio::test]
    async fn claims_only_due_entries() {
        let queue = MemoryPropagationQueue::default();
        let now = Utc::now();
        queue.enqueue(pending(now - chrono::Duration::seconds(1))).await.unwrap();
        queue.enqueue(pending(now + chrono::Duration::seconds(60))).await.unwrap();

        let claimed = queue.claim_due("w1", now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(queue.claim_due("w2", now, 10).await.unwrap().is_empty());

        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.pending, stats.running), (1, 1));
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_dead_letter() {
        let queue = MemoryPropagationQueue::new(BackoffPolicy {
            max_attempts: 3,
            ..BackoffPolicy::default()
        });
        let id = queue.enqueue(pending(Utc::now())).await.unwrap();

        // attempt 2 of 3 fails: rescheduled
        let first = queue.mark_failed(id, "timeout", FailureKind::Retryable).await.unwrap();
        assert!(matches!(first, FailureDisposition::Rescheduled { .. }));

        // attempt 3 of 3 fails: dead letter
        let second = queue.mark_failed(id, "timeout", FailureKind::Retryable).await.unwrap();
        assert_eq!(second, FailureDisposition::DeadLettered);

        let now = Utc::now();
        let dead = queue.claim_dead_letters(now, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert!(queue.claim_dead_letters(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_immediately() {
        let queue = MemoryPropagationQueue::default();
        let id = queue.enqueue(pending(Utc::now())).await.unwrap();
        let disposition = queue
            .mark_failed(id, "corrupt record", FailureKind::NonRetryable)
            .await
            .unwrap();
        assert_eq!(disposition, FailureDisposition::DeadLettered);
        assert_eq!(queue.stats().await.unwrap().dead_letter, 1);
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimed() {
        let queue = MemoryPropagationQueue::default().with_lease(Duration::from_secs(1));
        let now = Utc::now();
        queue.enqueue(pending(now)).await.unwrap();
        queue.claim_due("crashed-worker", now, 1).await.unwrap();

        let later = now + chrono::Duration::seconds(5);
        assert_eq!(queue.reclaim_expired(later).await.unwrap(), 1);
        assert_eq!(queue.claim_due("w2", later, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn abandoned_reconciliation_returns_to_dead_letter() {
        let queue = MemoryPropagationQueue::default().with_lease(Duration::from_secs(1));
        let now = Utc::now();
        let id = queue.dead_letter(pending(now)).await.unwrap();
        queue.claim_dead_letters(now, 10).await.unwrap();

        // Lease still live: nothing to release.
        assert_eq!(queue.reclaim_expired(now).await.unwrap(), 0);
        assert_eq!(queue.stats().await.unwrap().reconciling, 1);

        let later = now + chrono::Duration::seconds(5);
        assert_eq!(queue.reclaim_expired(later).await.unwrap(), 1);
        let stats = queue.stats().await.unwrap();
        assert_eq!((stats.reconciling, stats.dead_letter, stats.pending), (0, 1, 0));

        let again = queue.claim_dead_letters(later, 10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, id);
    }

    #[tokio::test]
    async fn cleanup_drops_succeeded_entries() {
        let queue = MemoryPropagationQueue::default();
        let id = queue.enqueue(pending(Utc::now())).await.unwrap();
        queue.mark_succeeded(id).await.unwrap();
        assert_eq!(queue.cleanup_succeeded().unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    }
}
