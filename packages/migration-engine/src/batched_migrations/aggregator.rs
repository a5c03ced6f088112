//! Status aggregation.
//!
//! Rolls per-job outcomes up into the owning migration's status. Only a
//! `running` migration is ever moved: `paused` belongs to the operator,
//! `pending` has no jobs yet, and terminal states stay put.

use serde::Serialize;

use super::job::BatchedMigrationJobStatus;
use super::model::BatchedMigrationStatus;

/// Number of jobs in each status for one migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub failed: i64,
    pub succeeded: i64,
}

impl JobCounts {
    /// Build from `(status, count)` rows as returned by a `GROUP BY status`.
    pub fn from_rows(rows: impl IntoIterator<Item = (BatchedMigrationJobStatus, i64)>) -> Self {
        let mut counts = Self::default();
        for (status, count) in rows {
            counts.add(status, count);
        }
        counts
    }

    pub fn add(&mut self, status: BatchedMigrationJobStatus, count: i64) {
        match status {
            BatchedMigrationJobStatus::Pending => self.pending += count,
            BatchedMigrationJobStatus::Running => self.running += count,
            BatchedMigrationJobStatus::Failed => self.failed += count,
            BatchedMigrationJobStatus::Succeeded => self.succeeded += count,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.running + self.failed + self.succeeded
    }

    /// No job is waiting to be claimed or currently held by a worker.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Status a migration should have given its job counts.
///
/// A failed job only fails the migration once its siblings have settled, so
/// one bad batch never stops the others from being worked.
pub fn next_status(current: BatchedMigrationStatus, counts: &JobCounts) -> BatchedMigrationStatus {
    if current != BatchedMigrationStatus::Running {
        return current;
    }

    if counts.total() == 0 || !counts.is_settled() {
        return current;
    }

    if counts.failed > 0 {
        BatchedMigrationStatus::Failed
    } else {
        BatchedMigrationStatus::Succeeded
    }
}
