//! Persistence seam for batched migrations.
//!
//! The worker, admin surface and enqueue API talk to a
//! [`BatchedMigrationStore`]. [`PostgresBatchedMigrationStore`] is the real
//! thing; [`MemoryBatchedMigrationStore`](super::MemoryBatchedMigrationStore)
//! backs tests that do not need a database.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::aggregator::JobCounts;
use super::job::{BatchedMigrationJob, BatchedMigrationJobStatus};
use super::model::BatchedMigrationRecord;
use super::planner::StartOutcome;
use super::BatchedMigrationParameters;
use crate::common::{JobError, Result};

#[async_trait]
pub trait BatchedMigrationStore: Send + Sync {
    /// Insert a new `pending` instance.
    async fn enqueue(&self, project: &str, name: &str, timestamp: &str) -> Result<BatchedMigrationRecord>;

    async fn find(&self, id: Uuid) -> Result<BatchedMigrationRecord>;

    async fn list(&self, project: &str) -> Result<Vec<BatchedMigrationRecord>>;

    /// `pending` and `running` instances, oldest timestamp first.
    async fn find_runnable(&self, project: &str) -> Result<Vec<BatchedMigrationRecord>>;

    /// Plan jobs and leave `pending`. Only the first caller plans.
    async fn start(&self, id: Uuid, params: &BatchedMigrationParameters) -> Result<StartOutcome>;

    async fn reclaim_expired_jobs(&self, id: Uuid) -> Result<u64>;

    async fn claim_next_job(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<BatchedMigrationJob>>;

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> Result<bool>;

    async fn mark_job_succeeded(&self, job_id: Uuid, worker_id: &str) -> Result<bool>;

    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &JobError,
        retry: bool,
    ) -> Result<bool>;

    async fn save_job_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: serde_json::Value,
    ) -> Result<bool>;

    async fn job_counts(&self, id: Uuid) -> Result<JobCounts>;

    /// Recompute the migration status from its job counts.
    async fn refresh_status(&self, id: Uuid) -> Result<BatchedMigrationRecord>;

    async fn list_jobs(
        &self,
        id: Uuid,
        status: Option<BatchedMigrationJobStatus>,
    ) -> Result<Vec<BatchedMigrationJob>>;

    async fn find_job(&self, job_id: Uuid) -> Result<BatchedMigrationJob>;

    async fn pause(&self, id: Uuid) -> Result<BatchedMigrationRecord>;

    async fn resume(&self, id: Uuid) -> Result<BatchedMigrationRecord>;

    async fn retry_job(&self, job_id: Uuid) -> Result<BatchedMigrationJob>;

    async fn retry_failed_jobs(&self, id: Uuid) -> Result<u64>;
}

/// Store backed by the `batched_migrations` and `batched_migration_jobs` tables
#[derive(Clone)]
pub struct PostgresBatchedMigrationStore {
    db_pool: PgPool,
}

impl PostgresBatchedMigrationStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl BatchedMigrationStore for PostgresBatchedMigrationStore {
    async fn enqueue(&self, project: &str, name: &str, timestamp: &str) -> Result<BatchedMigrationRecord> {
        BatchedMigrationRecord::insert_pending(project, name, timestamp, &self.db_pool).await
    }

    async fn find(&self, id: Uuid) -> Result<BatchedMigrationRecord> {
        BatchedMigrationRecord::find_by_id(id, &self.db_pool).await
    }

    async fn list(&self, project: &str) -> Result<Vec<BatchedMigrationRecord>> {
        BatchedMigrationRecord::list(project, &self.db_pool).await
    }

    async fn find_runnable(&self, project: &str) -> Result<Vec<BatchedMigrationRecord>> {
        BatchedMigrationRecord::find_runnable(project, &self.db_pool).await
    }

    async fn start(&self, id: Uuid, params: &BatchedMigrationParameters) -> Result<StartOutcome> {
        BatchedMigrationRecord::start(id, params, &self.db_pool).await
    }

    async fn reclaim_expired_jobs(&self, id: Uuid) -> Result<u64> {
        BatchedMigrationJob::reclaim_expired(id, &self.db_pool).await
    }

    async fn claim_next_job(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<BatchedMigrationJob>> {
        BatchedMigrationJob::claim_next(id, worker_id, lease, &self.db_pool).await
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> Result<bool> {
        BatchedMigrationJob::heartbeat(job_id, worker_id, lease, &self.db_pool).await
    }

    async fn mark_job_succeeded(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        BatchedMigrationJob::mark_succeeded(job_id, worker_id, &self.db_pool).await
    }

    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &JobError,
        retry: bool,
    ) -> Result<bool> {
        BatchedMigrationJob::mark_failed(job_id, worker_id, error, retry, &self.db_pool).await
    }

    async fn save_job_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: serde_json::Value,
    ) -> Result<bool> {
        BatchedMigrationJob::save_progress(job_id, worker_id, progress, &self.db_pool).await
    }

    async fn job_counts(&self, id: Uuid) -> Result<JobCounts> {
        BatchedMigrationJob::counts(id, &self.db_pool).await
    }

    async fn refresh_status(&self, id: Uuid) -> Result<BatchedMigrationRecord> {
        BatchedMigrationRecord::refresh_status(id, &self.db_pool).await
    }

    async fn list_jobs(
        &self,
        id: Uuid,
        status: Option<BatchedMigrationJobStatus>,
    ) -> Result<Vec<BatchedMigrationJob>> {
        BatchedMigrationJob::list(id, status, &self.db_pool).await
    }

    async fn find_job(&self, job_id: Uuid) -> Result<BatchedMigrationJob> {
        BatchedMigrationJob::find_by_id(job_id, &self.db_pool).await
    }

    async fn pause(&self, id: Uuid) -> Result<BatchedMigrationRecord> {
        BatchedMigrationRecord::pause(id, &self.db_pool).await
    }

    async fn resume(&self, id: Uuid) -> Result<BatchedMigrationRecord> {
        BatchedMigrationRecord::resume(id, &self.db_pool).await
    }

    async fn retry_job(&self, job_id: Uuid) -> Result<BatchedMigrationJob> {
        BatchedMigrationJob::retry(job_id, &self.db_pool).await
    }

    async fn retry_failed_jobs(&self, id: Uuid) -> Result<u64> {
        BatchedMigrationJob::retry_failed(id, &self.db_pool).await
    }
}
