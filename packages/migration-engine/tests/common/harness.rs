//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared by every test in the binary; the engine
//! schema is created once. Each test gets its own `project`, which keeps
//! ledger and batched migration rows from different tests apart.

use std::sync::Arc;

use anyhow::{Context, Result};
use migration_engine::batched_migrations::{
    BatchedMigrationRegistry, BatchedMigrationWorker, PostgresBatchedMigrationStore,
};
use migration_engine::kernel::schema::ensure_schema;
use migration_engine::{MigrationCatalog, MigrationKernel};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::fixtures::test_worker_config;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=migration_engine=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!(
            "postgresql://postgres:postgres@{}:{}/postgres",
            pg_host, pg_port
        );

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to Postgres for schema setup")?;
        ensure_schema(&pool)
            .await
            .context("Failed to create migration engine schema")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test database access.
///
/// ```ignore
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let kernel = ctx.kernel(catalog);
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
    /// Unique per test
    pub project: String,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(&infra.db_url)
            .await
            .context("Failed to connect to test database")?;

        Ok(Self {
            db_pool,
            project: format!("test_{}", Uuid::new_v4().simple()),
        })
    }

    pub fn kernel(&self, catalog: MigrationCatalog) -> MigrationKernel {
        MigrationKernel::new(self.db_pool.clone(), self.project.clone(), catalog)
    }

    pub fn store(&self) -> Arc<PostgresBatchedMigrationStore> {
        Arc::new(PostgresBatchedMigrationStore::new(self.db_pool.clone()))
    }

    /// Worker for this test's project with fast timings.
    pub fn worker(
        &self,
        registry: Arc<BatchedMigrationRegistry>,
        max_attempts: i32,
    ) -> BatchedMigrationWorker {
        BatchedMigrationWorker::new(
            self.store(),
            registry,
            test_worker_config(&self.project, max_attempts),
        )
    }

    /// Name prefixed with this test's project, for tables the test creates.
    pub fn table(&self, name: &str) -> String {
        format!("{}_{}", self.project, name)
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table)
            .fetch_one(&self.db_pool)
            .await?;
        Ok(exists)
    }
}
