//! In-memory batched migration store.
//!
//! Same state machine as the Postgres store, held under one lock so every
//! operation is atomic. Used by tests and for exercising workers without a
//! database.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::aggregator::{self, JobCounts};
use super::job::{BatchedMigrationJob, BatchedMigrationJobStatus};
use super::model::{BatchedMigrationRecord, BatchedMigrationStatus};
use super::planner::{self, StartOutcome};
use super::store::BatchedMigrationStore;
use super::BatchedMigrationParameters;
use crate::common::{db_id, JobError, MigrationError, Result};

#[derive(Default)]
struct State {
    migrations: Vec<BatchedMigrationRecord>,
    jobs: Vec<BatchedMigrationJob>,
}

impl State {
    fn migration(&self, id: Uuid) -> Result<&BatchedMigrationRecord> {
        self.migrations
            .iter()
            .find(|m| m.id == id)
            .ok_or(MigrationError::BatchedMigrationNotFound(id))
    }

    fn migration_mut(&mut self, id: Uuid) -> Result<&mut BatchedMigrationRecord> {
        self.migrations
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(MigrationError::BatchedMigrationNotFound(id))
    }

    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut BatchedMigrationJob> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(MigrationError::JobNotFound(job_id))
    }

    /// Running job still held by `worker_id`.
    fn held_job_mut(&mut self, job_id: Uuid, worker_id: &str) -> Option<&mut BatchedMigrationJob> {
        self.jobs.iter_mut().find(|j| {
            j.id == job_id
                && j.status == BatchedMigrationJobStatus::Running
                && j.worker_id.as_deref() == Some(worker_id)
        })
    }

    fn counts(&self, id: Uuid) -> JobCounts {
        JobCounts::from_rows(
            self.jobs
                .iter()
                .filter(|j| j.batched_migration_id == id)
                .map(|j| (j.status, 1)),
        )
    }

    fn reopen_if_failed(&mut self, id: Uuid) -> Result<()> {
        let migration = self.migration_mut(id)?;
        if migration.status == BatchedMigrationStatus::Failed {
            migration.status = BatchedMigrationStatus::Running;
            migration.updated_at = Utc::now();
        }
        Ok(())
    }

    fn transition(
        &mut self,
        id: Uuid,
        action: &'static str,
        from: BatchedMigrationStatus,
        to: BatchedMigrationStatus,
    ) -> Result<BatchedMigrationRecord> {
        let migration = self.migration_mut(id)?;
        if migration.status != from {
            return Err(MigrationError::InvalidTransition {
                id,
                action,
                status: migration.status,
            });
        }
        migration.status = to;
        migration.updated_at = Utc::now();
        Ok(migration.clone())
    }
}

fn reset_to_pending(job: &mut BatchedMigrationJob) {
    job.status = BatchedMigrationJobStatus::Pending;
    job.worker_id = None;
    job.lease_expires_at = None;
    job.finished_at = None;
    job.updated_at = Utc::now();
}

fn lease_deadline(lease: Duration) -> chrono::DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(365));
    Utc::now() + lease
}

/// Store that keeps everything in process memory
#[derive(Default)]
pub struct MemoryBatchedMigrationStore {
    state: RwLock<State>,
}

impl MemoryBatchedMigrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every job, in creation order.
    pub fn jobs(&self) -> Vec<BatchedMigrationJob> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .jobs
            .clone()
    }

    /// Backdate a job's lease so the next reclaim treats its worker as dead.
    pub fn expire_lease(&self, job_id: Uuid) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let job = state.job_mut(job_id)?;
        job.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        Ok(())
    }
}

#[async_trait]
impl BatchedMigrationStore for MemoryBatchedMigrationStore {
    async fn enqueue(&self, project: &str, name: &str, timestamp: &str) -> Result<BatchedMigrationRecord> {
        let now = Utc::now();
        let migration = BatchedMigrationRecord {
            id: db_id(),
            project: project.to_string(),
            name: name.to_string(),
            timestamp: timestamp.to_string(),
            batch_size: None,
            min_value: None,
            max_value: None,
            status: BatchedMigrationStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
        };

        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .migrations
            .push(migration.clone());

        Ok(migration)
    }

    async fn find(&self, id: Uuid) -> Result<BatchedMigrationRecord> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.migration(id).cloned()
    }

    async fn list(&self, project: &str) -> Result<Vec<BatchedMigrationRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut migrations: Vec<_> = state
            .migrations
            .iter()
            .filter(|m| m.project == project)
            .cloned()
            .collect();
        migrations.sort_by(|a, b| (&a.timestamp, a.created_at).cmp(&(&b.timestamp, b.created_at)));
        Ok(migrations)
    }

    async fn find_runnable(&self, project: &str) -> Result<Vec<BatchedMigrationRecord>> {
        let mut migrations = self.list(project).await?;
        migrations.retain(|m| {
            matches!(
                m.status,
                BatchedMigrationStatus::Pending | BatchedMigrationStatus::Running
            )
        });
        Ok(migrations)
    }

    async fn start(&self, id: Uuid, params: &BatchedMigrationParameters) -> Result<StartOutcome> {
        let ranges = planner::batch_ranges(params)?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let current = state.migration(id)?.clone();
        if current.status != BatchedMigrationStatus::Pending {
            return Ok(StartOutcome::AlreadyStarted(current));
        }

        let mut job_count = 0;
        for range in ranges {
            job_count += 1;
            let exists = state
                .jobs
                .iter()
                .any(|j| j.batched_migration_id == id && j.min_value == range.start);
            if !exists {
                state.jobs.push(BatchedMigrationJob::new(id, range));
            }
        }

        let now = Utc::now();
        let migration = state.migration_mut(id)?;
        migration.status = if job_count == 0 {
            BatchedMigrationStatus::Succeeded
        } else {
            BatchedMigrationStatus::Running
        };
        migration.min_value = Some(params.min);
        migration.max_value = Some(params.max);
        migration.batch_size = Some(params.batch_size);
        migration.started_at = Some(now);
        migration.updated_at = now;
        let migration = migration.clone();

        if job_count == 0 {
            Ok(StartOutcome::Empty(migration))
        } else {
            Ok(StartOutcome::Planned {
                migration,
                job_count,
            })
        }
    }

    async fn reclaim_expired_jobs(&self, id: Uuid) -> Result<u64> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut reclaimed = 0;
        for job in state.jobs.iter_mut().filter(|j| {
            j.batched_migration_id == id
                && j.status == BatchedMigrationJobStatus::Running
                && j.lease_expires_at.is_some_and(|expires| expires < now)
        }) {
            reset_to_pending(job);
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    async fn claim_next_job(
        &self,
        id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<BatchedMigrationJob>> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.migration(id)?.status != BatchedMigrationStatus::Running {
            return Ok(None);
        }

        let next = state
            .jobs
            .iter_mut()
            .filter(|j| j.batched_migration_id == id && j.status == BatchedMigrationJobStatus::Pending)
            .min_by_key(|j| j.min_value);

        let Some(job) = next else {
            return Ok(None);
        };

        let now = Utc::now();
        job.status = BatchedMigrationJobStatus::Running;
        job.attempts += 1;
        job.worker_id = Some(worker_id.to_string());
        job.lease_expires_at = Some(lease_deadline(lease));
        job.started_at = Some(now);
        job.finished_at = None;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, job_id: Uuid, worker_id: &str, lease: Duration) -> Result<bool> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = state.held_job_mut(job_id, worker_id) else {
            return Ok(false);
        };
        job.lease_expires_at = Some(lease_deadline(lease));
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_job_succeeded(&self, job_id: Uuid, worker_id: &str) -> Result<bool> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = state.held_job_mut(job_id, worker_id) else {
            return Ok(false);
        };
        let now = Utc::now();
        job.status = BatchedMigrationJobStatus::Succeeded;
        if let Some(data) = job.data.as_object_mut() {
            data.remove("error");
        }
        job.lease_expires_at = None;
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn mark_job_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &JobError,
        retry: bool,
    ) -> Result<bool> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = state.held_job_mut(job_id, worker_id) else {
            return Ok(false);
        };
        let error = serde_json::to_value(error).map_err(anyhow::Error::from)?;
        if !job.data.is_object() {
            job.data = serde_json::json!({});
        }
        if let Some(data) = job.data.as_object_mut() {
            data.insert("error".to_string(), error);
        }

        if retry {
            reset_to_pending(job);
        } else {
            let now = Utc::now();
            job.status = BatchedMigrationJobStatus::Failed;
            job.lease_expires_at = None;
            job.finished_at = Some(now);
            job.updated_at = now;
        }
        Ok(true)
    }

    async fn save_job_progress(
        &self,
        job_id: Uuid,
        worker_id: &str,
        progress: serde_json::Value,
    ) -> Result<bool> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = state.held_job_mut(job_id, worker_id) else {
            return Ok(false);
        };
        if !job.data.is_object() {
            job.data = serde_json::json!({});
        }
        if let Some(data) = job.data.as_object_mut() {
            data.insert("progress".to_string(), progress);
        }
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn job_counts(&self, id: Uuid) -> Result<JobCounts> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.counts(id))
    }

    async fn refresh_status(&self, id: Uuid) -> Result<BatchedMigrationRecord> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let counts = state.counts(id);
        let migration = state.migration_mut(id)?;
        let next = aggregator::next_status(migration.status, &counts);
        if next != migration.status {
            migration.status = next;
            migration.updated_at = Utc::now();
        }
        Ok(migration.clone())
    }

    async fn list_jobs(
        &self,
        id: Uuid,
        status: Option<BatchedMigrationJobStatus>,
    ) -> Result<Vec<BatchedMigrationJob>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<_> = state
            .jobs
            .iter()
            .filter(|j| j.batched_migration_id == id)
            .filter(|j| status.map_or(true, |status| j.status == status))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.min_value);
        Ok(jobs)
    }

    async fn find_job(&self, job_id: Uuid) -> Result<BatchedMigrationJob> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
            .ok_or(MigrationError::JobNotFound(job_id))
    }

    async fn pause(&self, id: Uuid) -> Result<BatchedMigrationRecord> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.transition(
            id,
            "pause",
            BatchedMigrationStatus::Running,
            BatchedMigrationStatus::Paused,
        )
    }

    async fn resume(&self, id: Uuid) -> Result<BatchedMigrationRecord> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.transition(
            id,
            "resume",
            BatchedMigrationStatus::Paused,
            BatchedMigrationStatus::Running,
        )
    }

    async fn retry_job(&self, job_id: Uuid) -> Result<BatchedMigrationJob> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let job = state.job_mut(job_id)?;
        if job.status != BatchedMigrationJobStatus::Failed {
            return Err(MigrationError::InvalidJobTransition {
                id: job_id,
                status: job.status,
            });
        }
        reset_to_pending(job);
        job.attempts = 0;
        let job = job.clone();
        state.reopen_if_failed(job.batched_migration_id)?;
        Ok(job)
    }

    async fn retry_failed_jobs(&self, id: Uuid) -> Result<u64> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.migration(id)?;

        let mut retried = 0;
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.batched_migration_id == id && j.status == BatchedMigrationJobStatus::Failed)
        {
            reset_to_pending(job);
            job.attempts = 0;
            retried += 1;
        }

        if retried > 0 {
            state.reopen_if_failed(id)?;
        }
        Ok(retried)
    }
}
