//! Operator surface for batched migrations.
//!
//! Everything an operator needs to inspect and steer a backfill: listing,
//! per-job detail, pause/resume and retrying failed jobs. Backs the
//! `migrate_cli` batched migration commands.

use std::sync::Arc;

use futures::future::try_join_all;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::aggregator::JobCounts;
use super::enqueue;
use super::job::{BatchedMigrationJob, BatchedMigrationJobStatus};
use super::model::BatchedMigrationRecord;
use super::registry::BatchedMigrationRegistry;
use super::store::BatchedMigrationStore;
use crate::common::{MigrationError, Result};

/// A migration together with its job counts
#[derive(Debug, Clone, Serialize)]
pub struct BatchedMigrationSummary {
    #[serde(flatten)]
    pub migration: BatchedMigrationRecord,
    pub jobs: JobCounts,
}

#[derive(Clone)]
pub struct BatchedMigrationAdmin {
    store: Arc<dyn BatchedMigrationStore>,
    registry: Arc<BatchedMigrationRegistry>,
    project: String,
}

impl BatchedMigrationAdmin {
    pub fn new(
        store: Arc<dyn BatchedMigrationStore>,
        registry: Arc<BatchedMigrationRegistry>,
        project: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            project: project.into(),
        }
    }

    pub async fn list(&self) -> Result<Vec<BatchedMigrationSummary>> {
        let migrations = self.store.list(&self.project).await?;
        try_join_all(migrations.into_iter().map(|migration| async move {
            let jobs = self.store.job_counts(migration.id).await?;
            Ok::<_, MigrationError>(BatchedMigrationSummary { migration, jobs })
        }))
        .await
    }

    pub async fn show(&self, id: Uuid) -> Result<BatchedMigrationSummary> {
        let migration = self.store.find(id).await?;
        let jobs = self.store.job_counts(id).await?;
        Ok(BatchedMigrationSummary { migration, jobs })
    }

    /// Jobs of one migration, optionally only those in `status`.
    pub async fn jobs(
        &self,
        id: Uuid,
        status: Option<BatchedMigrationJobStatus>,
    ) -> Result<Vec<BatchedMigrationJob>> {
        self.store.find(id).await?;
        self.store.list_jobs(id, status).await
    }

    pub async fn enqueue(&self, name: &str) -> Result<BatchedMigrationRecord> {
        enqueue::enqueue_batched_migration(self.store.as_ref(), &self.registry, &self.project, name)
            .await
    }

    /// Stop workers claiming new jobs. Jobs already running finish.
    pub async fn pause(&self, id: Uuid) -> Result<BatchedMigrationRecord> {
        self.store.pause(id).await
    }

    /// Resume a paused migration.
    ///
    /// Status is recomputed right away so a migration whose jobs all finished
    /// while it was paused does not sit in `running`.
    pub async fn resume(&self, id: Uuid) -> Result<BatchedMigrationRecord> {
        self.store.resume(id).await?;
        self.store.refresh_status(id).await
    }

    /// Re-run one failed job, reopening its migration if it had failed.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<BatchedMigrationJob> {
        self.store.retry_job(job_id).await
    }

    /// Re-run every failed job of a migration.
    pub async fn retry_failed_jobs(&self, id: Uuid) -> Result<u64> {
        let retried = self.store.retry_failed_jobs(id).await?;
        info!(batched_migration_id = %id, retried, "Retried failed batched migration jobs");
        Ok(retried)
    }
}
