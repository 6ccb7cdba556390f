//! Reconciliation sweeper: the backstop for lost propagations.
//!
//! ```text
//! Sweep (every interval)
//!     │
//!     ├── Reclaim propagations whose worker lease expired
//!     │
//!     ├── Claim dead letters ──► re-propagate from current origin
//!     │
//!     └── Scan origin rides touched within the trailing window,
//!         page by page in (updated_at, id) order
//!             │
//!             └── mirror missing or behind, origin older than grace
//!                     └──► re-propagate (same (ride_id, version) key)
//! ```
//!
//! The scan walks the whole window every pass. If a pass is cut short (a
//! store error, or the pass timeout), the next pass resumes after the last
//! page it finished, so a large window is still covered in bounded time.
//!
//! # Invariants
//!
//! - **Idempotent**: repairs go through the version-keyed propagation, so
//!   overlapping sweeps or a sweep racing the worker cannot regress a mirror
//! - **Nothing dropped**: a failed or abandoned repair goes back to the queue
//! - **Not on the hot path**: runs on its own interval and timeout budget

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::SweeperConfig;
use crate::queue::{ClaimedPropagation, FailureKind, PropagationQueue};
use crate::ride::{Ride, Side};
use crate::store::{timed, RideStores, ScanCursor};
use crate::sync::Synchronizer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: u64,
    pub dead_letters: usize,
    pub scanned: usize,
    pub diverged: usize,
    pub repaired: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Check {
    InSync,
    WithinGrace,
    Repaired,
    Failed,
}

pub struct ReconciliationSweeper {
    stores: RideStores,
    sync: Arc<Synchronizer>,
    config: SweeperConfig,
    store_timeout: std::time::Duration,
    /// Where an interrupted window scan picks up, per origin side.
    resume: DashMap<Side, ScanCursor>,
}

impl ReconciliationSweeper {
    pub fn new(
        stores: RideStores,
        sync: Arc<Synchronizer>,
        config: SweeperConfig,
        store_timeout: std::time::Duration,
    ) -> Self {
        Self {
            stores,
            sync,
            config,
            store_timeout,
            resume: DashMap::new(),
        }
    }

    fn queue(&self) -> &Arc<dyn PropagationQueue> {
        self.sync.queue()
    }

    /// One reconciliation pass as of `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the propagation queue fails. Individual store
    /// failures are counted in [`SweepReport::failed`].
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> anyhow::Result<SweepReport> {
        let mut report = SweepReport {
            reclaimed: self.queue().reclaim_expired(now).await?,
            ..SweepReport::default()
        };

        let dead = self
            .queue()
            .claim_dead_letters(now, self.config.max_dead_letters_per_sweep)
            .await?;
        report.dead_letters = dead.len();
        let dead_results: Vec<anyhow::Result<bool>> = stream::iter(dead)
            .map(|entry| self.repair_dead_letter(entry))
            .buffer_unordered(self.config.repair_concurrency)
            .collect()
            .await;
        for result in dead_results {
            if result? {
                report.repaired += 1;
            } else {
                report.failed += 1;
            }
        }

        let since = now - self.config.window();
        let cutoff = now - self.config.grace();
        for side in [Side::Passenger, Side::Rider] {
            self.scan_window(side, since, cutoff, &mut report).await;
        }

        if report.diverged > 0 || report.dead_letters > 0 || report.failed > 0 {
            info!(?report, "reconciliation sweep found drift");
        } else {
            debug!(?report, "reconciliation sweep clean");
        }
        Ok(report)
    }

    /// Check every origin ride on `side` touched since `since`.
    async fn scan_window(
        &self,
        side: Side,
        since: DateTime<Utc>,
        cutoff: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let page_size = self.config.scan_page_size;
        let mut after = self.resume.get(&side).map(|cursor| *cursor);
        if let Some(cursor) = after {
            debug!(%side, ride_id = %cursor.id, "resuming interrupted window scan");
        }

        loop {
            let page = match timed(
                self.store_timeout,
                self.stores
                    .side(side)
                    .origins_touched_since(side, since, after, page_size),
            )
            .await
            {
                Ok(page) => page,
                Err(err) => {
                    warn!(%side, error = %err, "sweeper could not list touched rides");
                    report.failed += 1;
                    return;
                }
            };

            let exhausted = page.len() < page_size;
            let next = page.last().map(ScanCursor::after);
            report.scanned += page.len();

            let checks: Vec<Check> = stream::iter(page)
                .map(|origin| self.check_pair(origin, cutoff))
                .buffer_unordered(self.config.repair_concurrency)
                .collect()
                .await;
            for check in checks {
                match check {
                    Check::InSync | Check::WithinGrace => {}
                    Check::Repaired => {
                        report.diverged += 1;
                        report.repaired += 1;
                    }
                    Check::Failed => {
                        report.diverged += 1;
                        report.failed += 1;
                    }
                }
            }

            match next {
                Some(cursor) if !exhausted => {
                    self.resume.insert(side, cursor);
                    after = Some(cursor);
                }
                _ => {
                    self.resume.remove(&side);
                    return;
                }
            }
        }
    }

    async fn repair_dead_letter(&self, entry: ClaimedPropagation) -> anyhow::Result<bool> {
        match self
            .sync
            .propagate_latest(entry.ride_id, entry.origin_side, entry.target_version)
            .await
        {
            Ok(outcome) => {
                info!(ride_id = %entry.ride_id, version = entry.target_version, ?outcome, "dead letter repaired");
                self.queue().mark_succeeded(entry.id).await?;
                Ok(true)
            }
            Err(err) => {
                error!(
                    ride_id = %entry.ride_id,
                    version = entry.target_version,
                    error = %err,
                    "dead letter repair failed; will retry next sweep"
                );
                self.queue()
                    .mark_failed(entry.id, &err.to_string(), FailureKind::NonRetryable)
                    .await?;
                Ok(false)
            }
        }
    }

    async fn check_pair(&self, origin: Ride, cutoff: DateTime<Utc>) -> Check {
        let mirror = match timed(
            self.store_timeout,
            self.stores.mirror(origin.origin_side).get(origin.id),
        )
        .await
        {
            Ok(mirror) => mirror,
            Err(err) => {
                warn!(ride_id = %origin.id, error = %err, "sweeper could not read mirror");
                return Check::Failed;
            }
        };

        if mirror.as_ref().is_some_and(|m| m.version >= origin.version) {
            return Check::InSync;
        }
        if origin.updated_at > cutoff {
            return Check::WithinGrace;
        }

        warn!(
            ride_id = %origin.id,
            origin_version = origin.version,
            mirror_version = mirror.as_ref().map(|m| m.version),
            "mirror diverged beyond grace period"
        );

        match self
            .sync
            .propagate_latest(origin.id, origin.origin_side, origin.version)
            .await
        {
            Ok(_) => Check::Repaired,
            Err(err) => {
                self.sync
                    .defer_or_fail(origin.id, origin.origin_side, origin.version, 1, &err)
                    .await;
                Check::Failed
            }
        }
    }

    /// Sweep every interval until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so startup is quiet.
        interval.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match tokio::time::timeout(self.config.sweep_timeout(), self.sweep_once(Utc::now())).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => error!(error = %err, "reconciliation sweep failed"),
                        Err(_) => warn!(
                            timeout_secs = self.config.sweep_timeout_secs,
                            "reconciliation sweep timed out"
                        ),
                    }
                }
            }
        }

        debug!("reconciliation sweeper stopped");
    }
}
