//! Durable, leased job queue.
//!
//! Jobs are pending rows claimed by workers under a timed lease. A worker
//! that dies without unwinding simply lets its lease expire; the next
//! `lease` call reclaims the job. Nothing is acknowledged until `complete`
//! commits, which is what makes the whole engine restartable.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::SqlitePool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;

/// Tag dispatched on by the scheduler's handler registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum JobType {
    Analysis,
    Embedding,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Analysis => "analysis",
            JobType::Embedding => "embedding",
        }
    }
}

/// Job lifecycle. A job never regresses: pending -> leased -> done, or
/// back to pending for a retry, or dead once attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Leased,
    Done,
    Dead,
}

/// A durably persisted work item.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    /// Human-readable idempotency token; duplicates are dropped on
    /// enqueue.
    pub job_key: String,
    pub payload: Vec<u8>,
    pub status: JobState,
    pub attempts: i64,
    pub max_attempts: i64,
    pub leased_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub run_after: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub leased: u64,
    pub done: u64,
    pub dead: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.leased + self.done + self.dead
    }
}

/// Tunables for [`JobQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    /// Base of the exponential retry back-off.
    pub backoff_base: Duration,
    /// Cap on any single retry delay.
    pub backoff_cap: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
        }
    }
}

/// The queue over the shared store.
#[derive(Debug, Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a pending job. A duplicate key is silently dropped and the
    /// existing job's id is returned with `inserted = false`.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        key: &str,
        payload: &[u8],
    ) -> Result<(String, bool), StoreError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs
                (id, job_type, job_key, payload, status, max_attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(job_type)
        .bind(key)
        .bind(payload)
        .bind(self.config.max_attempts as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            metrics::counter!("queue_jobs_enqueued_total", "type" => job_type.as_str())
                .increment(1);
            return Ok((id, true));
        }

        let existing: String = sqlx::query_scalar("SELECT id FROM jobs WHERE job_key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        debug!(key, existing, "duplicate enqueue dropped");
        Ok((existing, false))
    }

    /// Atomically claim the oldest leasable job for `owner`.
    ///
    /// Leasable means pending with no future `run_after`, or leased with an
    /// expired lease (a crashed worker's leftovers). Claiming counts as one
    /// attempt.
    pub async fn lease(
        &self,
        owner: &str,
        lease_duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));

        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'leased',
                leased_by = ?1,
                lease_expires_at = ?2,
                attempts = attempts + 1,
                updated_at = ?3
            WHERE id = (
                SELECT id FROM jobs
                WHERE (status = 'pending' AND (run_after IS NULL OR run_after <= ?3))
                   OR (status = 'leased' AND lease_expires_at <= ?3)
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(owner)
        .bind(expires)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            metrics::counter!("queue_jobs_leased_total", "type" => job.job_type.as_str())
                .increment(1);
        }
        Ok(job)
    }

    /// Mark a job done. This is the acknowledgement; until it commits the
    /// job remains re-leasable after lease expiry.
    pub async fn complete(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done', leased_by = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "job",
                id: id.to_string(),
            });
        }
        metrics::counter!("queue_jobs_completed_total").increment(1);
        Ok(())
    }

    /// Record a failure. Retryable failures with attempts left return the
    /// job to pending behind an exponential-with-jitter back-off;
    /// everything else parks it dead.
    pub async fn fail(
        &self,
        id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<JobState, StoreError> {
        let row: Option<(i64, i64)> =
            sqlx::query_as("SELECT attempts, max_attempts FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((attempts, max_attempts)) = row else {
            return Err(StoreError::NotFound {
                entity: "job",
                id: id.to_string(),
            });
        };

        let new_state = if retryable && attempts < max_attempts {
            let delay = self.retry_backoff(attempts as u32);
            let run_after = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(1));
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    leased_by = NULL,
                    lease_expires_at = NULL,
                    run_after = ?,
                    last_error = ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(run_after)
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
            debug!(id, attempts, delay_ms = delay.as_millis() as u64, "job retried");
            JobState::Pending
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'dead',
                    leased_by = NULL,
                    lease_expires_at = NULL,
                    last_error = ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(error)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
            warn!(id, attempts, error, "job dead-lettered");
            JobState::Dead
        };

        metrics::counter!(
            "queue_jobs_failed_total",
            "terminal" => if new_state == JobState::Dead { "dead" } else { "retry" },
        )
        .increment(1);
        Ok(new_state)
    }

    /// Extend the lease for a job still owned by `owner`.
    pub async fn heartbeat(
        &self,
        id: &str,
        owner: &str,
        lease_duration: Duration,
    ) -> Result<(), StoreError> {
        let expires = Utc::now()
            + chrono::Duration::from_std(lease_duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
        sqlx::query(
            r#"
            UPDATE jobs
            SET lease_expires_at = ?, updated_at = ?
            WHERE id = ? AND leased_by = ? AND status = 'leased'
            "#,
        )
        .bind(expires)
        .bind(Utc::now())
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Counts by state.
    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let rows: Vec<(JobState, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        let mut stats = QueueStats::default();
        for (state, count) in rows {
            let count = count as u64;
            match state {
                JobState::Pending => stats.pending = count,
                JobState::Leased => stats.leased = count,
                JobState::Done => stats.done = count,
                JobState::Dead => stats.dead = count,
            }
        }
        Ok(stats)
    }

    /// Sweep expired leases: jobs with attempts left return to pending,
    /// exhausted ones go dead. The lease query already reclaims expired
    /// jobs lazily; this sweep exists so stats and dead-lettering do not
    /// wait for the next lease.
    pub async fn requeue_expired(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let reclaimed = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', leased_by = NULL, lease_expires_at = NULL, updated_at = ?1
            WHERE status = 'leased' AND lease_expires_at <= ?1 AND attempts < max_attempts
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let dead = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'dead',
                leased_by = NULL,
                lease_expires_at = NULL,
                last_error = COALESCE(last_error, 'lease expired'),
                updated_at = ?1
            WHERE status = 'leased' AND lease_expires_at <= ?1 AND attempts >= max_attempts
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if reclaimed + dead > 0 {
            debug!(reclaimed, dead, "expired leases swept");
        }
        Ok(reclaimed + dead)
    }

    /// Delete done jobs older than `older_than`. Returns the rows removed.
    pub async fn purge_done(&self, older_than: Duration) -> Result<u64, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let removed = sqlx::query("DELETE FROM jobs WHERE status = 'done' AND updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }

    fn retry_backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = exp.min(self.config.backoff_cap);
        capped.mul_f64(rand::rng().random_range(0.5..1.5))
    }
}
