use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ride_dispatch::{
    BackoffPolicy, ClaimedPropagation, FailureDisposition, FailureKind, NewPropagation,
    PropagationQueue, QueueStats, RideId,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::store::parse_side;

/// PostgreSQL propagation queue.
#[derive(Clone)]
pub struct PgPropagationQueue {
    pool: PgPool,
    backoff: BackoffPolicy,
    lease_ms: i64,
}

impl PgPropagationQueue {
    /// Create a queue that retries on `backoff`.
    ///
    /// # Default Settings
    ///
    /// - Lease timeout: 60 seconds
    pub fn new(pool: PgPool, backoff: BackoffPolicy) -> Self {
        Self {
            pool,
            backoff,
            lease_ms: 60_000,
        }
    }

    /// Create a queue with the default retry schedule.
    pub fn with_defaults(pool: PgPool) -> Self {
        Self::new(pool, crate::default_backoff())
    }

    /// How long a worker may hold a claimed entry before it is reclaimed.
    #[must_use]
    pub fn with_lease_timeout(mut self, lease_ms: i64) -> Self {
        self.lease_ms = lease_ms;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert(&self, entry: NewPropagation, status: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO ride_propagations
                (id, ride_id, origin_side, target_version, status, attempt, run_at, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(id)
        .bind(entry.ride_id.as_uuid())
        .bind(entry.origin_side.as_str())
        .bind(i64::try_from(entry.target_version)?)
        .bind(status)
        .bind(i32::try_from(entry.attempt)?)
        .bind(entry.run_at)
        .bind(entry.last_error)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Delete succeeded entries last touched before `older_than`.
    pub async fn cleanup_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM ride_propagations
            WHERE status = 'succeeded'
              AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PropagationQueue for PgPropagationQueue {
    async fn enqueue(&self, entry: NewPropagation) -> Result<Uuid> {
        self.insert(entry, "pending").await
    }

    async fn dead_letter(&self, entry: NewPropagation) -> Result<Uuid> {
        self.insert(entry, "dead_letter").await
    }

    /// Claim due entries, skipping rows other workers hold.
    async fn claim_due(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedPropagation>> {
        let lease_expires_at = now + Duration::milliseconds(self.lease_ms);

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM ride_propagations
                WHERE status = 'pending'
                  AND run_at <= $1
                ORDER BY run_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ride_propagations
            SET status = 'running',
                worker_id = $3,
                lease_expires_at = $4,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, ride_id, origin_side, target_version, attempt
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit)?)
        .bind(worker_id)
        .bind(lease_expires_at)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_claimed).collect()
    }

    async fn mark_succeeded(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ride_propagations
            SET status = 'succeeded',
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reschedule on the backoff policy, or dead-letter.
    ///
    /// # Retry Logic
    ///
    /// - Retryable failures with attempts left: `run_at = now + delay_after(attempt)`
    /// - Non-retryable failures: immediately dead-lettered
    /// - Attempts exhausted: dead-lettered
    async fn mark_failed(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
    ) -> Result<FailureDisposition> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT attempt FROM ride_propagations WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("propagation {id} not found"))?;
        let attempt = u32::try_from(row.get::<i32, _>("attempt"))?;

        let disposition = match kind {
            FailureKind::Retryable if self.backoff.allows_retry_after(attempt) => {
                let run_at = Utc::now() + Duration::from_std(self.backoff.delay_after(attempt))?;

                sqlx::query(
                    r#"
                    UPDATE ride_propagations
                    SET status = 'pending',
                        run_at = $1,
                        attempt = attempt + 1,
                        last_error = $2,
                        error_kind = 'retryable',
                        worker_id = NULL,
                        lease_expires_at = NULL,
                        updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(run_at)
                .bind(error)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                FailureDisposition::Rescheduled { run_at }
            }
            _ => {
                sqlx::query(
                    r#"
                    UPDATE ride_propagations
                    SET status = 'dead_letter',
                        last_error = $1,
                        error_kind = $2,
                        worker_id = NULL,
                        lease_expires_at = NULL,
                        updated_at = NOW()
                    WHERE id = $3
                    "#,
                )
                .bind(error)
                .bind(match kind {
                    FailureKind::Retryable => "retryable",
                    FailureKind::NonRetryable => "non_retryable",
                })
                .bind(id)
                .execute(&mut *tx)
                .await?;

                FailureDisposition::DeadLettered
            }
        };

        tx.commit().await?;
        Ok(disposition)
    }

    /// Lease dead letters to a sweep so an abandoned pass gives them back.
    async fn claim_dead_letters(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ClaimedPropagation>> {
        let lease_expires_at = now + Duration::milliseconds(self.lease_ms);

        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM ride_propagations
                WHERE status = 'dead_letter'
                ORDER BY updated_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ride_propagations
            SET status = 'reconciling',
                lease_expires_at = $2,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, ride_id, origin_side, target_version, attempt
            "#,
        )
        .bind(i64::try_from(limit)?)
        .bind(lease_expires_at)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_claimed).collect()
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ride_propagations
            SET status = CASE status
                    WHEN 'running' THEN 'pending'
                    ELSE 'dead_letter'
                END,
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status IN ('running', 'reconciling')
              AND lease_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'running') as running,
                COUNT(*) FILTER (WHERE status = 'succeeded') as succeeded,
                COUNT(*) FILTER (WHERE status = 'dead_letter') as dead_letter,
                COUNT(*) FILTER (WHERE status = 'reconciling') as reconciling
            FROM ride_propagations
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.get("pending"),
            running: row.get("running"),
            succeeded: row.get("succeeded"),
            dead_letter: row.get("dead_letter"),
            reconciling: row.get("reconciling"),
        })
    }
}

fn decode_claimed(row: &PgRow) -> Result<ClaimedPropagation> {
    let origin_side: String = row.try_get("origin_side")?;
    Ok(ClaimedPropagation {
        id: row.try_get("id")?,
        ride_id: RideId::from_uuid(row.try_get("ride_id")?),
        origin_side: parse_side(&origin_side)
            .ok_or_else(|| anyhow!("unknown origin side {origin_side:?}"))?,
        target_version: u64::try_from(row.try_get::<i64, _>("target_version")?)?,
        attempt: u32::try_from(row.try_get::<i32, _>("attempt")?)?,
    })
}
