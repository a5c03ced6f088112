//! Batched migration worker.
//!
//! Runs in every application process. Each iteration works for up to
//! `work_duration`, claiming and executing one job at a time, then sleeps
//! for `sleep_duration`. An iteration ends early once nothing is claimable.
//!
//! Per step the worker:
//! 1. plans any `pending` migration it has an implementation for
//! 2. returns jobs with expired leases to `pending`
//! 3. claims the lowest pending job of the oldest `running` migration
//! 4. executes it while a heartbeat task extends the lease
//! 5. records the outcome and lets the aggregator update the migration

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::job::BatchedMigrationJob;
use super::model::{BatchedMigrationRecord, BatchedMigrationStatus};
use super::registry::BatchedMigrationRegistry;
use super::store::BatchedMigrationStore;
use super::{BatchedMigration, JobContext};
use crate::common::{JobError, MigrationError, Result};
use crate::config::Config;

/// Configuration for the batched migration worker.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct BatchedMigrationWorkerConfig {
    /// Only migrations of this project are worked.
    #[builder(default = "default".to_string())]
    pub project: String,
    #[builder(default = format!("batched-migrations-{}", Uuid::new_v4()))]
    pub worker_id: String,
    /// How long one iteration keeps claiming jobs
    #[builder(default = Duration::from_secs(60))]
    pub work_duration: Duration,
    /// Pause between iterations
    #[builder(default = Duration::from_secs(30))]
    pub sleep_duration: Duration,
    /// A claimed job without a heartbeat for this long is reclaimed
    #[builder(default = Duration::from_secs(300))]
    pub lease_duration: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub heartbeat_interval: Duration,
    /// Claims per job before a failure sticks (1 = never retry automatically)
    #[builder(default = 1)]
    pub max_attempts: i32,
}

impl Default for BatchedMigrationWorkerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl BatchedMigrationWorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self::builder()
            .project(config.project.clone())
            .work_duration(config.batched_migrations_work_duration)
            .sleep_duration(config.batched_migrations_sleep_duration)
            .lease_duration(config.batched_migrations_lease_duration)
            .heartbeat_interval(config.batched_migrations_heartbeat_interval)
            .max_attempts(config.batched_migrations_max_attempts)
            .build()
    }
}

/// Claims and executes batched migration jobs.
pub struct BatchedMigrationWorker {
    store: Arc<dyn BatchedMigrationStore>,
    registry: Arc<BatchedMigrationRegistry>,
    config: BatchedMigrationWorkerConfig,
}

impl BatchedMigrationWorker {
    pub fn new(
        store: Arc<dyn BatchedMigrationStore>,
        registry: Arc<BatchedMigrationRegistry>,
        config: BatchedMigrationWorkerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &BatchedMigrationWorkerConfig {
        &self.config
    }

    /// Work-then-sleep loop until `shutdown` is cancelled.
    ///
    /// A job already executing when shutdown arrives is finished first.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            project = %self.config.project,
            registered = self.registry.len(),
            "Batched migration worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let deadline = Instant::now() + self.config.work_duration;
            match self.work_until(Some(deadline), &shutdown).await {
                Ok(0) => debug!("No batched migration work"),
                Ok(jobs) => debug!(jobs, "Batched migration iteration finished"),
                Err(e) => error!(error = %e, "Batched migration iteration failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.sleep_duration) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "Batched migration worker stopped");
        Ok(())
    }

    /// Run `run` on a background task.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { self.run(token).await });
        WorkerHandle { shutdown, handle }
    }

    /// Execute jobs until nothing is claimable. Returns how many jobs ran.
    pub async fn work_until_idle(&self) -> Result<usize> {
        self.work_until(None, &CancellationToken::new()).await
    }

    async fn work_until(&self, deadline: Option<Instant>, shutdown: &CancellationToken) -> Result<usize> {
        let mut jobs = 0;
        while !shutdown.is_cancelled() && deadline.map_or(true, |deadline| Instant::now() < deadline) {
            if !self.step().await? {
                break;
            }
            jobs += 1;
        }
        Ok(jobs)
    }

    /// Claim and execute at most one job. Returns false when there was
    /// nothing to claim.
    pub async fn step(&self) -> Result<bool> {
        let runnable = self.store.find_runnable(&self.config.project).await?;

        for migration in runnable {
            let Some(implementation) = self.registry.get(&migration.name) else {
                warn!(
                    batched_migration_id = %migration.id,
                    name = %migration.name,
                    "No implementation registered for batched migration; skipping"
                );
                continue;
            };

            let migration = if migration.status == BatchedMigrationStatus::Pending {
                match self.start_migration(&migration, implementation.as_ref()).await? {
                    Some(started) => started,
                    None => continue,
                }
            } else {
                migration
            };

            if migration.status != BatchedMigrationStatus::Running {
                continue;
            }

            self.store.reclaim_expired_jobs(migration.id).await?;

            let claimed = self
                .store
                .claim_next_job(migration.id, &self.config.worker_id, self.config.lease_duration)
                .await?;

            match claimed {
                Some(job) => {
                    self.process_job(&migration, job, implementation.as_ref()).await?;
                    return Ok(true);
                }
                None => {
                    // All jobs are taken or done; settle the status if they're done
                    self.store.refresh_status(migration.id).await?;
                }
            }
        }

        Ok(false)
    }

    /// Plan a pending migration. `None` means it could not be planned this
    /// time and stays `pending` for the next iteration.
    async fn start_migration(
        &self,
        migration: &BatchedMigrationRecord,
        implementation: &dyn BatchedMigration,
    ) -> Result<Option<BatchedMigrationRecord>> {
        let params = match implementation.get_parameters().await {
            Ok(params) => params,
            Err(e) => {
                error!(
                    batched_migration_id = %migration.id,
                    name = %migration.name,
                    error = %e,
                    "Failed to get batched migration parameters"
                );
                return Ok(None);
            }
        };

        match self.store.start(migration.id, &params).await {
            Ok(outcome) => Ok(Some(outcome.migration().clone())),
            Err(MigrationError::InvalidParameters(reason)) => {
                error!(
                    batched_migration_id = %migration.id,
                    name = %migration.name,
                    reason = %reason,
                    "Invalid batched migration parameters"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn process_job(
        &self,
        migration: &BatchedMigrationRecord,
        job: BatchedMigrationJob,
        implementation: &dyn BatchedMigration,
    ) -> Result<()> {
        let worker_id = self.config.worker_id.as_str();

        debug!(
            batched_migration_id = %migration.id,
            job_id = %job.id,
            min_value = job.min_value,
            max_value = job.max_value,
            attempt = job.attempts,
            "Executing batched migration job"
        );

        let result = {
            let heartbeat_cancel = CancellationToken::new();
            // Stops the heartbeat however this block is left
            let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
            let heartbeat = self.spawn_heartbeat(job.id, heartbeat_cancel.clone());

            let ctx = JobContext::new(migration, &job, self.store.as_ref(), worker_id);
            let result = AssertUnwindSafe(implementation.execute(job.min_value, job.max_value, &ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_error(panic)));

            heartbeat_cancel.cancel();
            let _ = heartbeat.await;
            result
        };

        match result {
            Ok(()) => {
                if !self.store.mark_job_succeeded(job.id, worker_id).await? {
                    warn!(job_id = %job.id, "Lost batched migration job before completion; result discarded");
                }
            }
            Err(e) => {
                let retry = job.attempts < self.config.max_attempts;
                warn!(
                    batched_migration_id = %migration.id,
                    job_id = %job.id,
                    attempt = job.attempts,
                    retry,
                    error = %e,
                    "Batched migration job failed"
                );
                let error = JobError::from(&e);
                if !self.store.mark_job_failed(job.id, worker_id, &error, retry).await? {
                    warn!(job_id = %job.id, "Lost batched migration job before recording failure");
                }
            }
        }

        self.store.refresh_status(migration.id).await?;
        Ok(())
    }

    fn spawn_heartbeat(&self, job_id: Uuid, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.store.clone();
        let worker_id = self.config.worker_id.clone();
        let lease = self.config.lease_duration;
        let heartbeat_interval = self.config.heartbeat_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match store.heartbeat(job_id, &worker_id, lease).await {
                            Ok(true) => {}
                            Ok(false) => {
                                warn!(job_id = %job_id, "Batched migration job lease lost");
                                break;
                            }
                            Err(e) => warn!(job_id = %job_id, error = %e, "Heartbeat failed"),
                        }
                    }
                }
            }
        })
    }
}

/// A panic inside `execute` fails the job like a returned error.
fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
    let message = panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    anyhow::anyhow!("batched migration panicked: {}", message)
}

/// Handle to a worker started with [`BatchedMigrationWorker::spawn`].
pub struct WorkerHandle {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for the current job to finish.
    pub async fn stop(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await.map_err(anyhow::Error::from)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = BatchedMigrationWorkerConfig::default();
        assert_eq!(config.project, "default");
        assert_eq!(config.work_duration, Duration::from_secs(60));
        assert_eq!(config.sleep_duration, Duration::from_secs(30));
        assert_eq!(config.max_attempts, 1);
        assert!(config.worker_id.starts_with("batched-migrations-"));
    }

    #[test]
    fn worker_ids_are_unique_per_config() {
        let a = BatchedMigrationWorkerConfig::default();
        let b = BatchedMigrationWorkerConfig::default();
        assert_ne!(a.worker_id, b.worker_id);
    }

    #[test]
    fn panic_payloads_become_job_errors() {
        let err = panic_error(Box::new("range exploded"));
        assert_eq!(err.to_string(), "batched migration panicked: range exploded");

        let err = panic_error(Box::new(format!("row {} is corrupt", 7)));
        assert_eq!(err.to_string(), "batched migration panicked: row 7 is corrupt");

        let err = panic_error(Box::new(42_u8));
        assert_eq!(err.to_string(), "batched migration panicked: unknown panic payload");
    }

    #[test]
    fn builder_overrides() {
        let config = BatchedMigrationWorkerConfig::builder()
            .project("app")
            .worker_id("w1")
            .max_attempts(3)
            .lease_duration(Duration::from_millis(50))
            .build();
        assert_eq!(config.project, "app");
        assert_eq!(config.worker_id, "w1");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.lease_duration, Duration::from_millis(50));
    }
}
