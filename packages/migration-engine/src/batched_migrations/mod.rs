//! Batched migrations for large, row-range-scoped backfills.
//!
//! A batched migration covers an inclusive key range `[min, max]`. The first
//! time a worker picks it up the range is split into jobs of at most
//! `batch_size` keys; workers in any number of processes then claim jobs one
//! at a time, run [`BatchedMigration::execute`] on the job's sub-range and
//! record the outcome.
//!
//! # Architecture
//!
//! ```text
//! Sequential migration / operator
//!     │
//!     └─► enqueue (status = pending)
//!
//! BatchedMigrationWorker (every process)
//!     │
//!     ├─► pending?  get_parameters() → planner → jobs (status = running)
//!     ├─► reclaim jobs whose lease expired
//!     ├─► claim next pending job (FOR UPDATE SKIP LOCKED)
//!     ├─► execute(start, end) with heartbeats
//!     ├─► mark job succeeded / failed
//!     └─► aggregator recomputes the migration status
//! ```
//!
//! `execute` must be idempotent: a job whose worker died is executed again
//! once its lease expires.

pub mod admin;
pub mod aggregator;
pub mod enqueue;
mod job;
mod memory_store;
mod model;
pub mod planner;
mod registry;
mod store;
mod worker;

pub use admin::{BatchedMigrationAdmin, BatchedMigrationSummary};
pub use aggregator::JobCounts;
pub use job::{BatchedMigrationJob, BatchedMigrationJobStatus};
pub use memory_store::MemoryBatchedMigrationStore;
pub use model::{BatchedMigrationRecord, BatchedMigrationStatus};
pub use planner::{BatchRange, StartOutcome};
pub use registry::BatchedMigrationRegistry;
pub use store::{BatchedMigrationStore, PostgresBatchedMigrationStore};
pub use worker::{BatchedMigrationWorker, BatchedMigrationWorkerConfig, WorkerHandle};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default number of keys per job.
pub const DEFAULT_BATCH_SIZE: i64 = 1_000;

/// Key range a batched migration covers, and how finely to split it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchedMigrationParameters {
    pub min: i64,
    pub max: i64,
    pub batch_size: i64,
}

impl BatchedMigrationParameters {
    pub fn new(min: i64, max: i64, batch_size: i64) -> Self {
        Self {
            min,
            max,
            batch_size,
        }
    }

    /// Range `[1, max]` for a `SELECT MAX(id)` result; `None` (empty table)
    /// gives an empty range.
    pub fn for_max(max: Option<i64>) -> Self {
        match max {
            Some(max) => Self::new(1, max, DEFAULT_BATCH_SIZE),
            None => Self::new(1, 0, DEFAULT_BATCH_SIZE),
        }
    }

    pub fn with_batch_size(self, batch_size: i64) -> Self {
        Self { batch_size, ..self }
    }

    /// `min > max`: nothing to migrate.
    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }
}

/// A batched migration supplied by the application.
///
/// Implementations own whatever they need (usually a `PgPool`).
#[async_trait]
pub trait BatchedMigration: Send + Sync + 'static {
    /// Full key range to cover. Called once, when the migration starts.
    async fn get_parameters(&self) -> anyhow::Result<BatchedMigrationParameters>;

    /// Migrate keys `start..=end`.
    ///
    /// Must be safe to repeat on the same range (e.g. `UPDATE ... WHERE col
    /// IS NULL` rather than an unconditional increment).
    async fn execute(&self, start: i64, end: i64, ctx: &JobContext<'_>) -> anyhow::Result<()>;
}

/// What a running job can see and record about itself.
pub struct JobContext<'a> {
    migration: &'a BatchedMigrationRecord,
    job: &'a BatchedMigrationJob,
    store: &'a dyn BatchedMigrationStore,
    worker_id: &'a str,
}

impl<'a> JobContext<'a> {
    pub(crate) fn new(
        migration: &'a BatchedMigrationRecord,
        job: &'a BatchedMigrationJob,
        store: &'a dyn BatchedMigrationStore,
        worker_id: &'a str,
    ) -> Self {
        Self {
            migration,
            job,
            store,
            worker_id,
        }
    }

    pub fn migration(&self) -> &BatchedMigrationRecord {
        self.migration
    }

    pub fn job(&self) -> &BatchedMigrationJob {
        self.job
    }

    /// 1 on the first run of this job, higher on retries.
    pub fn attempt(&self) -> i32 {
        self.job.attempts
    }

    /// Persist progress notes under `data.progress` on the job row.
    ///
    /// Ignored if this worker no longer holds the job.
    pub async fn save_progress(&self, progress: serde_json::Value) -> crate::Result<()> {
        self.store
            .save_job_progress(self.job.id, self.worker_id, progress)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_max_of_empty_table_is_empty() {
        let params = BatchedMigrationParameters::for_max(None);
        assert!(params.is_empty());
    }

    #[test]
    fn for_max_starts_at_one() {
        let params = BatchedMigrationParameters::for_max(Some(2500));
        assert_eq!(params, BatchedMigrationParameters::new(1, 2500, DEFAULT_BATCH_SIZE));
        assert!(!params.is_empty());
    }

    #[test]
    fn single_key_range_is_not_empty() {
        assert!(!BatchedMigrationParameters::new(7, 7, 1).is_empty());
    }

    #[test]
    fn with_batch_size_keeps_range() {
        let params = BatchedMigrationParameters::for_max(Some(10)).with_batch_size(3);
        assert_eq!(params, BatchedMigrationParameters::new(1, 10, 3));
    }
}
