//! Batched migration records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection, PgExecutor, PgPool};
use tracing::info;
use uuid::Uuid;

use super::aggregator;
use super::job::BatchedMigrationJob;
use super::planner::{self, StartOutcome};
use super::BatchedMigrationParameters;
use crate::common::{db_id, MigrationError, Result};

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "batched_migration_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchedMigrationStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Failed,
    Succeeded,
}

impl BatchedMigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchedMigrationStatus::Pending => "pending",
            BatchedMigrationStatus::Running => "running",
            BatchedMigrationStatus::Paused => "paused",
            BatchedMigrationStatus::Failed => "failed",
            BatchedMigrationStatus::Succeeded => "succeeded",
        }
    }

    /// No further work will happen without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchedMigrationStatus::Failed | BatchedMigrationStatus::Succeeded
        )
    }
}

impl fmt::Display for BatchedMigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchedMigrationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchedMigrationStatus::Pending),
            "running" => Ok(BatchedMigrationStatus::Running),
            "paused" => Ok(BatchedMigrationStatus::Paused),
            "failed" => Ok(BatchedMigrationStatus::Failed),
            "succeeded" => Ok(BatchedMigrationStatus::Succeeded),
            other => Err(anyhow::anyhow!("unknown batched migration status: {}", other)),
        }
    }
}

// ============================================================================
// Record
// ============================================================================

/// One enqueued instance of a batched migration.
///
/// `batch_size`, `min_value` and `max_value` stay NULL until the planner
/// starts the migration.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BatchedMigrationRecord {
    pub id: Uuid,
    pub project: String,
    pub name: String,
    pub timestamp: String,
    pub batch_size: Option<i64>,
    pub min_value: Option<i64>,
    pub max_value: Option<i64>,
    pub status: BatchedMigrationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

impl BatchedMigrationRecord {
    /// Insert a new `pending` instance.
    pub async fn insert_pending<'e>(
        project: &str,
        name: &str,
        timestamp: &str,
        db: impl PgExecutor<'e>,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO batched_migrations (id, project, name, timestamp, status)
            VALUES ($1, $2, $3, $4, 'pending')
            RETURNING id, project, name, timestamp, batch_size, min_value, max_value,
                      status, created_at, updated_at, started_at
            "#,
        )
        .bind(db_id())
        .bind(project)
        .bind(name)
        .bind(timestamp)
        .fetch_one(db)
        .await
        .map_err(Into::into)
    }

    pub async fn find_optional<'e>(id: Uuid, db: impl PgExecutor<'e>) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project, name, timestamp, batch_size, min_value, max_value,
                   status, created_at, updated_at, started_at
            FROM batched_migrations
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
            .ok_or(MigrationError::BatchedMigrationNotFound(id))
    }

    /// Every instance for a project, in enqueue order
    pub async fn list<'e>(project: &str, db: impl PgExecutor<'e>) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project, name, timestamp, batch_size, min_value, max_value,
                   status, created_at, updated_at, started_at
            FROM batched_migrations
            WHERE project = $1
            ORDER BY timestamp, created_at
            "#,
        )
        .bind(project)
        .fetch_all(db)
        .await
        .map_err(Into::into)
    }

    /// Instances a worker should look at: `pending` (to plan) and `running`
    /// (to claim from), oldest timestamp first.
    pub async fn find_runnable<'e>(project: &str, db: impl PgExecutor<'e>) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project, name, timestamp, batch_size, min_value, max_value,
                   status, created_at, updated_at, started_at
            FROM batched_migrations
            WHERE project = $1
              AND status IN ('pending', 'running')
            ORDER BY timestamp, created_at
            "#,
        )
        .bind(project)
        .fetch_all(db)
        .await
        .map_err(Into::into)
    }

    async fn lock(id: Uuid, conn: &mut PgConnection) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project, name, timestamp, batch_size, min_value, max_value,
                   status, created_at, updated_at, started_at
            FROM batched_migrations
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(MigrationError::BatchedMigrationNotFound(id))
    }

    /// Plan and persist jobs, moving the migration out of `pending`.
    ///
    /// The row lock plus the status check make this a no-op for every caller
    /// but the first.
    pub async fn start(
        id: Uuid,
        params: &BatchedMigrationParameters,
        pool: &PgPool,
    ) -> Result<StartOutcome> {
        let ranges = planner::batch_ranges(params)?;

        let mut tx = pool.begin().await?;
        let migration = Self::lock(id, &mut tx).await?;

        if migration.status != BatchedMigrationStatus::Pending {
            tx.rollback().await?;
            return Ok(StartOutcome::AlreadyStarted(migration));
        }

        let job_count = BatchedMigrationJob::insert_ranges(id, ranges, &mut tx).await?;

        let status = if job_count == 0 {
            BatchedMigrationStatus::Succeeded
        } else {
            BatchedMigrationStatus::Running
        };

        let migration = sqlx::query_as::<_, Self>(
            r#"
            UPDATE batched_migrations
            SET status = $2,
                min_value = $3,
                max_value = $4,
                batch_size = $5,
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
            RETURNING id, project, name, timestamp, batch_size, min_value, max_value,
                      status, created_at, updated_at, started_at
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(params.min)
        .bind(params.max)
        .bind(params.batch_size)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            batched_migration_id = %id,
            name = %migration.name,
            jobs = job_count,
            status = %migration.status,
            "Batched migration started"
        );

        if job_count == 0 {
            Ok(StartOutcome::Empty(migration))
        } else {
            Ok(StartOutcome::Planned {
                migration,
                job_count,
            })
        }
    }

    /// Recompute status from job counts (see [`aggregator::next_status`]).
    pub async fn refresh_status(id: Uuid, pool: &PgPool) -> Result<Self> {
        let mut tx = pool.begin().await?;
        let migration = Self::lock(id, &mut tx).await?;
        let counts = BatchedMigrationJob::counts(id, &mut *tx).await?;

        let next = aggregator::next_status(migration.status, &counts);
        if next == migration.status {
            tx.commit().await?;
            return Ok(migration);
        }

        let migration = Self::set_status(id, next, &mut tx).await?;
        tx.commit().await?;

        info!(
            batched_migration_id = %id,
            name = %migration.name,
            status = %next,
            succeeded = counts.succeeded,
            failed = counts.failed,
            "Batched migration finished"
        );

        Ok(migration)
    }

    pub async fn pause<'e>(id: Uuid, db: impl PgExecutor<'e> + Copy) -> Result<Self> {
        Self::transition(
            id,
            "pause",
            BatchedMigrationStatus::Running,
            BatchedMigrationStatus::Paused,
            db,
        )
        .await
    }

    pub async fn resume<'e>(id: Uuid, db: impl PgExecutor<'e> + Copy) -> Result<Self> {
        Self::transition(
            id,
            "resume",
            BatchedMigrationStatus::Paused,
            BatchedMigrationStatus::Running,
            db,
        )
        .await
    }

    async fn transition<'e>(
        id: Uuid,
        action: &'static str,
        from: BatchedMigrationStatus,
        to: BatchedMigrationStatus,
        db: impl PgExecutor<'e> + Copy,
    ) -> Result<Self> {
        let updated = sqlx::query_as::<_, Self>(
            r#"
            UPDATE batched_migrations
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING id, project, name, timestamp, batch_size, min_value, max_value,
                      status, created_at, updated_at, started_at
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .fetch_optional(db)
        .await?;

        match updated {
            Some(migration) => {
                info!(batched_migration_id = %id, status = %to, "Batched migration {}d", action);
                Ok(migration)
            }
            None => {
                let current = Self::find_by_id(id, db).await?;
                Err(MigrationError::InvalidTransition {
                    id,
                    action,
                    status: current.status,
                })
            }
        }
    }

    /// Put a `failed` migration back to `running` after jobs were retried.
    pub(crate) async fn reopen_if_failed(id: Uuid, conn: &mut PgConnection) -> Result<()> {
        let reopened = sqlx::query(
            r#"
            UPDATE batched_migrations
            SET status = 'running', updated_at = NOW()
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(conn)
        .await?
        .rows_affected();

        if reopened > 0 {
            info!(batched_migration_id = %id, "Failed batched migration reopened for retry");
        }
        Ok(())
    }

    async fn set_status(
        id: Uuid,
        status: BatchedMigrationStatus,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE batched_migrations
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, project, name, timestamp, batch_size, min_value, max_value,
                      status, created_at, updated_at, started_at
            "#,
        )
        .bind(id)
        .bind(status)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }
}
