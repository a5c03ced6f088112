//! Batched migration jobs.
//!
//! One row per planned sub-range. Workers claim rows with `FOR UPDATE SKIP
//! LOCKED` and hold them under a lease they keep alive with heartbeats;
//! every completion write is conditional on the claiming worker still
//! holding the job.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgExecutor, PgPool};
use tracing::{info, warn};
use uuid::Uuid;

use super::aggregator::JobCounts;
use super::model::BatchedMigrationRecord;
use super::planner::BatchRange;
use crate::common::{db_id, JobError, MigrationError, Result};

/// Rows per `INSERT ... UNNEST` when materializing a plan.
const INSERT_CHUNK_SIZE: usize = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "batched_migration_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchedMigrationJobStatus {
    #[default]
    Pending,
    Running,
    Failed,
    Succeeded,
}

impl BatchedMigrationJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchedMigrationJobStatus::Pending => "pending",
            BatchedMigrationJobStatus::Running => "running",
            BatchedMigrationJobStatus::Failed => "failed",
            BatchedMigrationJobStatus::Succeeded => "succeeded",
        }
    }
}

impl fmt::Display for BatchedMigrationJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchedMigrationJobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchedMigrationJobStatus::Pending),
            "running" => Ok(BatchedMigrationJobStatus::Running),
            "failed" => Ok(BatchedMigrationJobStatus::Failed),
            "succeeded" => Ok(BatchedMigrationJobStatus::Succeeded),
            other => Err(anyhow::anyhow!("unknown job status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BatchedMigrationJob {
    pub id: Uuid,
    pub batched_migration_id: Uuid,
    pub min_value: i64,
    pub max_value: i64,
    pub status: BatchedMigrationJobStatus,
    /// Times this job has been claimed.
    pub attempts: i32,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Free-form JSON: `error` on failure, `progress` if the migration saves any.
    pub data: serde_json::Value,
}

impl BatchedMigrationJob {
    /// New unclaimed job for `range`.
    pub fn new(batched_migration_id: Uuid, range: BatchRange) -> Self {
        let now = Utc::now();
        Self {
            id: db_id(),
            batched_migration_id,
            min_value: range.start,
            max_value: range.end,
            status: BatchedMigrationJobStatus::Pending,
            attempts: 0,
            worker_id: None,
            lease_expires_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            data: serde_json::json!({}),
        }
    }

    /// Last recorded failure, kept until the job succeeds.
    pub fn error(&self) -> Option<JobError> {
        self.data
            .get("error")
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn progress(&self) -> Option<&serde_json::Value> {
        self.data.get("progress")
    }

    // ------------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------------

    /// Insert one pending job per range, `INSERT_CHUNK_SIZE` rows per
    /// statement, pulling ranges from `ranges` only as each chunk is built.
    ///
    /// `ON CONFLICT DO NOTHING` on `(batched_migration_id, min_value)` keeps a
    /// repeated plan from creating duplicate jobs. Returns how many ranges
    /// were planned.
    pub async fn insert_ranges(
        batched_migration_id: Uuid,
        ranges: impl IntoIterator<Item = BatchRange>,
        conn: &mut PgConnection,
    ) -> Result<usize> {
        let mut ranges = ranges.into_iter();
        let mut planned = 0;

        loop {
            let chunk: Vec<BatchRange> = ranges.by_ref().take(INSERT_CHUNK_SIZE).collect();
            if chunk.is_empty() {
                break;
            }
            planned += chunk.len();

            let ids: Vec<Uuid> = chunk.iter().map(|_| db_id()).collect();
            let mins: Vec<i64> = chunk.iter().map(|range| range.start).collect();
            let maxes: Vec<i64> = chunk.iter().map(|range| range.end).collect();

            sqlx::query(
                r#"
                INSERT INTO batched_migration_jobs (id, batched_migration_id, min_value, max_value, status)
                SELECT id, $1, min_value, max_value, 'pending'
                FROM UNNEST($2::uuid[], $3::bigint[], $4::bigint[]) AS t(id, min_value, max_value)
                ON CONFLICT (batched_migration_id, min_value) DO NOTHING
                "#,
            )
            .bind(batched_migration_id)
            .bind(&ids)
            .bind(&mins)
            .bind(&maxes)
            .execute(&mut *conn)
            .await?;
        }

        Ok(planned)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn find_optional<'e>(id: Uuid, db: impl PgExecutor<'e>) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, batched_migration_id, min_value, max_value, status, attempts, worker_id,
                   lease_expires_at, created_at, updated_at, started_at, finished_at, data
            FROM batched_migration_jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id<'e>(id: Uuid, db: impl PgExecutor<'e>) -> Result<Self> {
        Self::find_optional(id, db)
            .await?
            .ok_or(MigrationError::JobNotFound(id))
    }

    /// Jobs of one migration in range order, optionally filtered by status
    pub async fn list<'e>(
        batched_migration_id: Uuid,
        status: Option<BatchedMigrationJobStatus>,
        db: impl PgExecutor<'e>,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, batched_migration_id, min_value, max_value, status, attempts, worker_id,
                   lease_expires_at, created_at, updated_at, started_at, finished_at, data
            FROM batched_migration_jobs
            WHERE batched_migration_id = $1
              AND ($2::batched_migration_job_status IS NULL OR status = $2)
            ORDER BY min_value
            "#,
        )
        .bind(batched_migration_id)
        .bind(status)
        .fetch_all(db)
        .await
        .map_err(Into::into)
    }

    pub async fn counts<'e>(batched_migration_id: Uuid, db: impl PgExecutor<'e>) -> Result<JobCounts> {
        let rows = sqlx::query_as::<_, (BatchedMigrationJobStatus, i64)>(
            r#"
            SELECT status, COUNT(*)
            FROM batched_migration_jobs
            WHERE batched_migration_id = $1
            GROUP BY status
            "#,
        )
        .bind(batched_migration_id)
        .fetch_all(db)
        .await?;

        Ok(JobCounts::from_rows(rows))
    }

    // ------------------------------------------------------------------------
    // Claiming and leases
    // ------------------------------------------------------------------------

    /// Return `running` jobs whose lease expired to `pending`.
    pub async fn reclaim_expired<'e>(batched_migration_id: Uuid, db: impl PgExecutor<'e>) -> Result<u64> {
        let reclaimed = sqlx::query(
            r#"
            UPDATE batched_migration_jobs
            SET status = 'pending',
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE batched_migration_id = $1
              AND status = 'running'
              AND lease_expires_at < NOW()
            "#,
        )
        .bind(batched_migration_id)
        .execute(db)
        .await?
        .rows_affected();

        if reclaimed > 0 {
            warn!(
                batched_migration_id = %batched_migration_id,
                reclaimed,
                "Reclaimed batched migration jobs with expired leases"
            );
        }

        Ok(reclaimed)
    }

    /// Claim the lowest pending job of a `running` migration.
    ///
    /// `SKIP LOCKED` lets concurrent workers pass over a row another worker
    /// is claiming, so no two claims return the same job.
    pub async fn claim_next<'e>(
        batched_migration_id: Uuid,
        worker_id: &str,
        lease: Duration,
        db: impl PgExecutor<'e>,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            WITH next_job AS (
                SELECT j.id
                FROM batched_migration_jobs j
                JOIN batched_migrations m ON m.id = j.batched_migration_id
                WHERE j.batched_migration_id = $1
                  AND j.status = 'pending'
                  AND m.status = 'running'
                ORDER BY j.min_value
                LIMIT 1
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE batched_migration_jobs
            SET status = 'running',
                attempts = attempts + 1,
                worker_id = $2,
                lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                started_at = NOW(),
                finished_at = NULL,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM next_job)
            RETURNING id, batched_migration_id, min_value, max_value, status, attempts, worker_id,
                      lease_expires_at, created_at, updated_at, started_at, finished_at, data
            "#,
        )
        .bind(batched_migration_id)
        .bind(worker_id)
        .bind(lease.as_millis().to_string())
        .fetch_optional(db)
        .await
        .map_err(Into::into)
    }

    /// Extend the lease. Returns false if the worker lost the job.
    pub async fn heartbeat<'e>(
        id: Uuid,
        worker_id: &str,
        lease: Duration,
        db: impl PgExecutor<'e>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE batched_migration_jobs
            SET lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(lease.as_millis().to_string())
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// Returns false if the worker no longer held the job; nothing is written.
    pub async fn mark_succeeded<'e>(id: Uuid, worker_id: &str, db: impl PgExecutor<'e>) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE batched_migration_jobs
            SET status = 'succeeded',
                data = data - 'error',
                lease_expires_at = NULL,
                finished_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    /// Record a failure under `data.error`.
    ///
    /// With `retry` the job goes back to `pending` for another attempt,
    /// otherwise it becomes `failed`.
    pub async fn mark_failed<'e>(
        id: Uuid,
        worker_id: &str,
        error: &JobError,
        retry: bool,
        db: impl PgExecutor<'e>,
    ) -> Result<bool> {
        let status = if retry {
            BatchedMigrationJobStatus::Pending
        } else {
            BatchedMigrationJobStatus::Failed
        };

        let updated = sqlx::query(
            r#"
            UPDATE batched_migration_jobs
            SET status = $3,
                data = jsonb_set(data, '{error}', $4),
                worker_id = CASE WHEN $5 THEN NULL ELSE worker_id END,
                lease_expires_at = NULL,
                finished_at = CASE WHEN $5 THEN NULL ELSE NOW() END,
                updated_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(status)
        .bind(Json(error))
        .bind(retry)
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    pub async fn save_progress<'e>(
        id: Uuid,
        worker_id: &str,
        progress: serde_json::Value,
        db: impl PgExecutor<'e>,
    ) -> Result<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE batched_migration_jobs
            SET data = jsonb_set(data, '{progress}', $3),
                updated_at = NOW()
            WHERE id = $1 AND worker_id = $2 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(Json(progress))
        .execute(db)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    // ------------------------------------------------------------------------
    // Operator retries
    // ------------------------------------------------------------------------

    /// Move a `failed` job back to `pending` with a fresh attempt budget,
    /// reopening its migration if the migration had failed.
    pub async fn retry(id: Uuid, pool: &PgPool) -> Result<Self> {
        let mut tx = pool.begin().await?;

        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE batched_migration_jobs
            SET status = 'pending',
                attempts = 0,
                worker_id = NULL,
                lease_expires_at = NULL,
                finished_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            RETURNING id, batched_migration_id, min_value, max_value, status, attempts, worker_id,
                      lease_expires_at, created_at, updated_at, started_at, finished_at, data
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(job) = job else {
            let current = Self::find_by_id(id, &mut *tx).await?;
            return Err(MigrationError::InvalidJobTransition {
                id,
                status: current.status,
            });
        };

        BatchedMigrationRecord::reopen_if_failed(job.batched_migration_id, &mut tx).await?;
        tx.commit().await?;

        info!(job_id = %id, batched_migration_id = %job.batched_migration_id, "Batched migration job queued for retry");
        Ok(job)
    }

    /// Retry every failed job of a migration. Returns how many were reset.
    pub async fn retry_failed(batched_migration_id: Uuid, pool: &PgPool) -> Result<u64> {
        let mut tx = pool.begin().await?;

        // Existence check; surfaces NotFound for unknown ids
        BatchedMigrationRecord::find_by_id(batched_migration_id, &mut *tx).await?;

        let retried = sqlx::query(
            r#"
            UPDATE batched_migration_jobs
            SET status = 'pending',
                attempts = 0,
                worker_id = NULL,
                lease_expires_at = NULL,
                finished_at = NULL,
                updated_at = NOW()
            WHERE batched_migration_id = $1 AND status = 'failed'
            "#,
        )
        .bind(batched_migration_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if retried > 0 {
            BatchedMigrationRecord::reopen_if_failed(batched_migration_id, &mut tx).await?;
        }
        tx.commit().await?;

        info!(batched_migration_id = %batched_migration_id, retried, "Failed batched migration jobs queued for retry");
        Ok(retried)
    }
}
