// MigrationKernel - everything a process needs to run migrations
//
// Holds the pool, project, catalog and batched migration store, and hands
// out runners, workers and the admin surface. Constructed once at startup
// and passed explicitly; there is no process-global migration state.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::batched_migrations::{
    enqueue, BatchedMigrationAdmin, BatchedMigrationRecord, BatchedMigrationRegistry,
    BatchedMigrationStore, BatchedMigrationWorker, BatchedMigrationWorkerConfig,
    PostgresBatchedMigrationStore,
};
use crate::catalog::MigrationCatalog;
use crate::common::Result;
use crate::config::Config;
use crate::migrations::{ExecutedMigration, SequentialRunner};

use super::schema;

#[derive(Clone)]
pub struct MigrationKernel {
    pub db_pool: PgPool,
    pub project: String,
    pub catalog: Arc<MigrationCatalog>,
    pub registry: Arc<BatchedMigrationRegistry>,
    pub batched_store: Arc<dyn BatchedMigrationStore>,
}

impl MigrationKernel {
    /// Kernel backed by Postgres for both layers.
    pub fn new(db_pool: PgPool, project: impl Into<String>, catalog: MigrationCatalog) -> Self {
        let batched_store = Arc::new(PostgresBatchedMigrationStore::new(db_pool.clone()));
        Self::with_store(db_pool, project, catalog, batched_store)
    }

    /// Kernel with a custom batched migration store.
    pub fn with_store(
        db_pool: PgPool,
        project: impl Into<String>,
        catalog: MigrationCatalog,
        batched_store: Arc<dyn BatchedMigrationStore>,
    ) -> Self {
        let registry = Arc::new(BatchedMigrationRegistry::from_catalog(&catalog));
        Self {
            db_pool,
            project: project.into(),
            catalog: Arc::new(catalog),
            registry,
            batched_store,
        }
    }

    /// Connection pool sized from config.
    pub async fn connect(config: &Config) -> anyhow::Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await
            .context("Failed to connect to database")
    }

    /// Create the engine tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        schema::ensure_schema(&self.db_pool).await
    }

    pub fn sequential_runner(&self) -> SequentialRunner {
        SequentialRunner::new(
            self.db_pool.clone(),
            self.project.clone(),
            self.catalog.clone(),
            self.registry.clone(),
        )
    }

    /// Apply pending sequential migrations.
    pub async fn run_migrations(&self) -> Result<Vec<ExecutedMigration>> {
        self.sequential_runner().run().await
    }

    /// Worker for this kernel's project. The config's project is overridden.
    pub fn worker(&self, config: BatchedMigrationWorkerConfig) -> BatchedMigrationWorker {
        let config = BatchedMigrationWorkerConfig {
            project: self.project.clone(),
            ..config
        };
        BatchedMigrationWorker::new(self.batched_store.clone(), self.registry.clone(), config)
    }

    pub fn admin(&self) -> BatchedMigrationAdmin {
        BatchedMigrationAdmin::new(
            self.batched_store.clone(),
            self.registry.clone(),
            self.project.clone(),
        )
    }

    /// Enqueue a registered batched migration outside any sequential migration.
    pub async fn enqueue_batched_migration(&self, name: &str) -> Result<BatchedMigrationRecord> {
        enqueue::enqueue_batched_migration(
            self.batched_store.as_ref(),
            &self.registry,
            &self.project,
            name,
        )
        .await
    }
}
