//! PostgreSQL implementation of [`job_worker::JobQueue`].
//!
//! # Features
//!
//! - Job acquisition via `FOR UPDATE SKIP LOCKED`, honoring a caller-supplied
//!   flag exclusion set
//! - Exponential backoff retry logic, capped at one hour
//! - Jobs that exhaust `max_attempts` are marked `failed` rather than
//!   rescheduled (no separate dead-letter table; `status = 'failed'` is the
//!   dead letter)
//! - Lease reclamation for jobs whose worker died mid-execution
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TYPE job_status AS ENUM ('pending', 'running', 'succeeded', 'failed');
//!
//! CREATE TABLE jobs (
//!     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!     task_identifier TEXT NOT NULL,
//!     payload JSONB NOT NULL DEFAULT '{}'::jsonb,
//!     queue_name TEXT,
//!     flags TEXT[] NOT NULL DEFAULT '{}',
//!
//!     status job_status NOT NULL DEFAULT 'pending',
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_attempts INTEGER NOT NULL DEFAULT 25,
//!
//!     run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     worker_id TEXT,
//!     lease_expires_at TIMESTAMPTZ,
//!
//!     last_error TEXT,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_jobs_ready ON jobs (run_at) WHERE status = 'pending';
//! CREATE INDEX idx_jobs_lease ON jobs (lease_expires_at) WHERE status = 'running';
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use job_worker_postgres::PgJobQueue;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let queue = PgJobQueue::new(pool);
//! let worker = job_worker::WorkerBuilder::new(queue, deps).build();
//! ```

use chrono::{DateTime, Duration, Utc};
use job_worker::{Job, JobQueue, QueueError};
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

/// Driver-level errors this crate's queries can fail with, kept distinct
/// from [`QueueError`] so a caller reaching for `sqlx` types directly (to
/// match on a specific database error code, say) isn't stuck with the
/// string-only variants the core crate's trait boundary exposes. Every
/// [`JobQueue`] method still returns `QueueError` at the trait boundary;
/// this is the richer error the `?`-propagated `sqlx::Error` converts
/// through on its way there.
#[derive(Error, Debug)]
pub enum JobStoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<JobStoreError> for QueueError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::Database(err) => QueueError::Acquisition(err.to_string()),
        }
    }
}

fn acquisition_err(err: sqlx::Error) -> QueueError {
    QueueError::Acquisition(JobStoreError::from(err).to_string())
}

fn report_err(err: sqlx::Error) -> QueueError {
    QueueError::Report(JobStoreError::from(err).to_string())
}

fn lease_recovery_err(err: sqlx::Error) -> QueueError {
    QueueError::LeaseRecovery(JobStoreError::from(err).to_string())
}

/// PostgreSQL-backed [`JobQueue`].
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    default_lease: Duration,
}

impl PgJobQueue {
    /// Create a queue with the default 60 second lease.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_lease: Duration::seconds(60),
        }
    }

    /// Create a queue with a custom lease duration, used as the claim window
    /// a job gets before lease recovery considers it abandoned.
    pub fn with_lease_timeout(pool: PgPool, lease: Duration) -> Self {
        Self { pool, default_lease: lease }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl JobQueue for PgJobQueue {
    async fn get_job(
        &self,
        worker_id: &str,
        use_node_time: bool,
        flags_to_skip: &[String],
    ) -> Result<Option<Job>, QueueError> {
        let row = if use_node_time {
            let lease_interval = sqlx::postgres::types::PgInterval::try_from(self.default_lease)
                .map_err(|err| QueueError::Acquisition(err.to_string()))?;
            sqlx::query(
                r#"
                WITH claimable AS (
                    SELECT id
                    FROM jobs
                    WHERE status = 'pending'
                      AND run_at <= NOW()
                      AND NOT (flags && $1)
                    ORDER BY run_at ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE jobs
                SET status = 'running',
                    worker_id = $2,
                    lease_expires_at = NOW() + $3::interval,
                    attempts = attempts + 1,
                    updated_at = NOW()
                WHERE id IN (SELECT id FROM claimable)
                RETURNING id, task_identifier, payload, attempts, max_attempts, queue_name, created_at
                "#,
            )
            .bind(flags_to_skip)
            .bind(worker_id)
            .bind(lease_interval)
            .fetch_optional(&self.pool)
            .await
        } else {
            let lease_expires_at = Utc::now() + self.default_lease;
            sqlx::query(
                r#"
                WITH claimable AS (
                    SELECT id
                    FROM jobs
                    WHERE status = 'pending'
                      AND run_at <= NOW()
                      AND NOT (flags && $1)
                    ORDER BY run_at ASC
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE jobs
                SET status = 'running',
                    worker_id = $2,
                    lease_expires_at = $3,
                    attempts = attempts + 1,
                    updated_at = NOW()
                WHERE id IN (SELECT id FROM claimable)
                RETURNING id, task_identifier, payload, attempts, max_attempts, queue_name, created_at
                "#,
            )
            .bind(flags_to_skip)
            .bind(worker_id)
            .bind(lease_expires_at)
            .fetch_optional(&self.pool)
            .await
        };

        let row = row.map_err(acquisition_err)?;

        Ok(row.map(|row| Job {
            id: row.get("id"),
            task_identifier: row.get("task_identifier"),
            payload: row.get("payload"),
            attempts: row.get("attempts"),
            max_attempts: row.get("max_attempts"),
            queue_name: row.get("queue_name"),
            created_at: row.get("created_at"),
        }))
    }

    async fn complete_job(&self, worker_id: &str, job_id: Uuid) -> Result<(), QueueError> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'succeeded',
                updated_at = NOW()
            WHERE id = $1 AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(report_err)?;

        Ok(())
    }

    async fn fail_job(&self, worker_id: &str, job_id: Uuid, message: &str) -> Result<(), QueueError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(report_err)?;

        let row = sqlx::query("SELECT attempts, max_attempts FROM jobs WHERE id = $1 AND worker_id = $2 FOR UPDATE")
            .bind(job_id)
            .bind(worker_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(report_err)?;

        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");

        if attempts >= max_attempts {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    last_error = $1,
                    updated_at = NOW()
                WHERE id = $2
                "#,
            )
            .bind(message)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(report_err)?;
        } else {
            let delay_secs = 2i64.pow(attempts.max(0) as u32).min(3600);
            let run_at = Utc::now() + Duration::seconds(delay_secs);

            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'pending',
                    run_at = $1,
                    last_error = $2,
                    worker_id = NULL,
                    lease_expires_at = NULL,
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(run_at)
            .bind(message)
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(report_err)?;
        }

        tx.commit().await.map_err(report_err)?;
        Ok(())
    }

    async fn reset_locked_at(&self) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND lease_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(lease_recovery_err)?;

        Ok(result.rows_affected())
    }
}

/// Maintenance helpers that are not part of the [`JobQueue`] contract but
/// are useful for an operator or a periodic cleanup job to call directly.
impl PgJobQueue {
    /// Delete succeeded jobs older than `older_than`.
    pub async fn cleanup_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE status = 'succeeded'
              AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(report_err)?;

        Ok(result.rows_affected())
    }

    /// Snapshot of queue depth by status, for health checks and dashboards.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'running') AS running,
                COUNT(*) FILTER (WHERE status = 'succeeded') AS succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(report_err)?;

        Ok(QueueStats {
            pending: row.get("pending"),
            running: row.get("running"),
            succeeded: row.get("succeeded"),
            failed: row.get("failed"),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_worker_testing::InMemoryJobQueue;

    #[tokio::test]
    async fn in_memory_queue_respects_flags_to_skip() {
        let queue = InMemoryJobQueue::new();
        queue.push_with_flags(
            Job {
                id: Uuid::new_v4(),
                task_identifier: "skip_me".into(),
                payload: serde_json::json!({}),
                attempts: 1,
                max_attempts: 3,
                queue_name: None,
                created_at: Utc::now(),
            },
            vec!["maintenance".to_string()],
        );
        queue.enqueue("run_me", serde_json::json!({}), 3);

        let leased = queue
            .get_job("worker-1", false, &["maintenance".to_string()])
            .await
            .unwrap()
            .expect("one job should be eligible");

        assert_eq!(leased.task_identifier, "run_me");
        assert_eq!(queue.pending_len(), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn claims_and_completes_a_job(pool: PgPool) {
        sqlx::query(
            "INSERT INTO jobs (id, task_identifier, payload, max_attempts) VALUES ($1, 'noop', '{}'::jsonb, 3)",
        )
        .bind(Uuid::new_v4())
        .execute(&pool)
        .await
        .unwrap();

        let queue = PgJobQueue::new(pool);
        let job = queue
            .get_job("worker-1", false, &[])
            .await
            .unwrap()
            .expect("job should be claimable");
        assert_eq!(job.attempts, 1);

        queue.complete_job("worker-1", job.id).await.unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.pending, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn failing_job_reschedules_until_max_attempts(pool: PgPool) {
        sqlx::query(
            "INSERT INTO jobs (id, task_identifier, payload, max_attempts) VALUES ($1, 'noop', '{}'::jsonb, 1)",
        )
        .bind(Uuid::new_v4())
        .execute(&pool)
        .await
        .unwrap();

        let queue = PgJobQueue::new(pool);
        let job = queue.get_job("worker-1", false, &[]).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.max_attempts, 1);

        queue.fail_job("worker-1", job.id, "boom").await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn reset_locked_at_reclaims_expired_leases(pool: PgPool) {
        let job_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO jobs (id, task_identifier, payload, max_attempts, status, worker_id, lease_expires_at) \
             VALUES ($1, 'noop', '{}'::jsonb, 3, 'running', 'dead-worker', NOW() - interval '1 minute')",
        )
        .bind(job_id)
        .execute(&pool)
        .await
        .unwrap();

        let queue = PgJobQueue::new(pool);
        let reclaimed = queue.reset_locked_at().await.unwrap();
        assert_eq!(reclaimed, 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
    }
}
