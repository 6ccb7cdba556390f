//! Background executor for queued propagations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::queue::{FailureDisposition, FailureKind, PropagationQueue};
use crate::sync::Synchronizer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub claimed: usize,
    pub converged: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

/// Claims due entries from the propagation queue and retries them.
pub struct SyncWorker {
    worker_id: String,
    sync: Arc<Synchronizer>,
    config: WorkerConfig,
}

impl SyncWorker {
    pub fn new(sync: Arc<Synchronizer>, config: WorkerConfig) -> Self {
        Self {
            worker_id: format!("sync-worker-{}", Uuid::new_v4()),
            sync,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn queue(&self) -> &Arc<dyn PropagationQueue> {
        self.sync.queue()
    }

    /// Process one batch of due entries.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue itself fails; propagation failures
    /// are recorded on the entries.
    pub async fn run_once(&self) -> anyhow::Result<WorkerReport> {
        let claimed = self
            .queue()
            .claim_due(&self.worker_id, Utc::now(), self.config.batch_size)
            .await?;

        let mut report = WorkerReport {
            claimed: claimed.len(),
            ..WorkerReport::default()
        };

        for job in claimed {
            match self
                .sync
                .propagate_latest(job.ride_id, job.origin_side, job.target_version)
                .await
            {
                Ok(outcome) => {
                    debug!(ride_id = %job.ride_id, attempt = job.attempt, ?outcome, "queued propagation converged");
                    self.queue().mark_succeeded(job.id).await?;
                    report.converged += 1;
                }
                Err(err) => {
                    let kind = if err.is_transient() {
                        FailureKind::Retryable
                    } else {
                        FailureKind::NonRetryable
                    };
                    match self.queue().mark_failed(job.id, &err.to_string(), kind).await? {
                        FailureDisposition::Rescheduled { run_at } => {
                            warn!(
                                ride_id = %job.ride_id,
                                version = job.target_version,
                                attempt = job.attempt,
                                %run_at,
                                error = %err,
                                "propagation retry failed, rescheduled"
                            );
                            report.rescheduled += 1;
                        }
                        FailureDisposition::DeadLettered => {
                            error!(
                                ride_id = %job.ride_id,
                                version = job.target_version,
                                attempt = job.attempt,
                                error = %err,
                                "propagation dead-lettered; handing to sweeper"
                            );
                            report.dead_lettered += 1;
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// Poll until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        debug!(worker_id = %self.worker_id, "sync worker started");

        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(report) if report.claimed > 0 => {
                    debug!(worker_id = %self.worker_id, ?report, "sync worker batch");
                    // More work may be due; skip the sleep.
                    continue;
                }
                Ok(_) => {}
                Err(err) => error!(worker_id = %self.worker_id, error = %err, "sync worker batch failed"),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(poll) => {}
            }
        }

        debug!(worker_id = %self.worker_id, "sync worker stopped");
    }
}
