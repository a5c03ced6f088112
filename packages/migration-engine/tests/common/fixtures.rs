//! Migrations and helpers shared by the integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use migration_engine::batched_migrations::{
    BatchedMigration, BatchedMigrationParameters, BatchedMigrationRegistry,
    BatchedMigrationWorkerConfig, JobContext,
};
use migration_engine::migrations::{Migration, MigrationContext};

pub const TIMESTAMP: &str = "20240101000000";

pub fn test_worker_config(project: &str, max_attempts: i32) -> BatchedMigrationWorkerConfig {
    BatchedMigrationWorkerConfig::builder()
        .project(project)
        .work_duration(Duration::from_secs(5))
        .sleep_duration(Duration::from_millis(10))
        .lease_duration(Duration::from_secs(30))
        .heartbeat_interval(Duration::from_millis(50))
        .max_attempts(max_attempts)
        .build()
}

/// Batched migration that records every range it executes and can be told
/// to fail particular ranges.
pub struct RecordingMigration {
    params: BatchedMigrationParameters,
    params_error: Mutex<bool>,
    executed: Mutex<Vec<(i64, i64)>>,
    attempts: Mutex<Vec<(i64, i32)>>,
    /// Range start -> remaining failures
    failures: Mutex<HashMap<i64, u32>>,
}

impl RecordingMigration {
    pub fn new(min: i64, max: i64, batch_size: i64) -> Arc<Self> {
        Arc::new(Self {
            params: BatchedMigrationParameters::new(min, max, batch_size),
            params_error: Mutex::new(false),
            executed: Mutex::new(Vec::new()),
            attempts: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        })
    }

    /// Fail the range starting at `start` the next `times` executions.
    pub fn fail_range(&self, start: i64, times: u32) {
        self.failures.lock().unwrap().insert(start, times);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn fail_parameters(&self, fail: bool) {
        *self.params_error.lock().unwrap() = fail;
    }

    /// Successfully executed ranges, sorted.
    pub fn executed(&self) -> Vec<(i64, i64)> {
        let mut executed = self.executed.lock().unwrap().clone();
        executed.sort();
        executed
    }

    /// `(range start, attempt)` for every execution, successful or not.
    pub fn attempts(&self) -> Vec<(i64, i32)> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchedMigration for RecordingMigration {
    async fn get_parameters(&self) -> anyhow::Result<BatchedMigrationParameters> {
        if *self.params_error.lock().unwrap() {
            bail!("source table unavailable");
        }
        Ok(self.params)
    }

    async fn execute(&self, start: i64, end: i64, ctx: &JobContext<'_>) -> anyhow::Result<()> {
        self.attempts.lock().unwrap().push((start, ctx.attempt()));

        let should_fail = {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&start) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };
        if should_fail {
            bail!("range {}..={} exploded", start, end);
        }

        self.executed.lock().unwrap().push((start, end));
        Ok(())
    }
}

pub fn registry_with(name: &str, migration: Arc<RecordingMigration>) -> Arc<BatchedMigrationRegistry> {
    let mut registry = BatchedMigrationRegistry::new();
    registry.register(name, TIMESTAMP, migration);
    Arc::new(registry)
}

/// Sequential migration that enqueues a batched migration and then
/// optionally fails.
pub struct EnqueueBackfill {
    pub batched_name: &'static str,
    pub fail_after_enqueue: bool,
}

#[async_trait]
impl Migration for EnqueueBackfill {
    async fn up(&self, ctx: &mut MigrationContext<'_>) -> anyhow::Result<()> {
        ctx.enqueue_batched_migration(self.batched_name).await?;
        if self.fail_after_enqueue {
            bail!("failing after enqueue");
        }
        Ok(())
    }
}

/// Catalog-owned handle to a shared [`RecordingMigration`], so a test can
/// put it in a catalog and still inspect what it recorded.
pub struct Recorded(pub Arc<RecordingMigration>);

#[async_trait]
impl BatchedMigration for Recorded {
    async fn get_parameters(&self) -> anyhow::Result<BatchedMigrationParameters> {
        self.0.get_parameters().await
    }

    async fn execute(&self, start: i64, end: i64, ctx: &JobContext<'_>) -> anyhow::Result<()> {
        self.0.execute(start, end, ctx).await
    }
}
