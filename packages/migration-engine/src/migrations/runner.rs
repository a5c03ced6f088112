//! Sequential migration runner.
//!
//! Diffs the catalog against the ledger and applies what is missing, one
//! migration at a time in catalog order. The first failure halts the run.
//!
//! Meant to run from a single deploy-time process. Keeping two runners from
//! racing is the deploy pipeline's job; if they do race, the ledger's unique
//! constraint makes the loser fail instead of recording a migration twice.

use std::sync::Arc;

use sqlx::{PgConnection, PgPool};
use tracing::{debug, info, warn};

use super::ledger::ExecutedMigration;
use super::{migrations_to_execute, MigrationContext};
use crate::batched_migrations::BatchedMigrationRegistry;
use crate::catalog::{MigrationBody, MigrationCatalog, MigrationDefinition, SequentialBody};
use crate::common::{MigrationError, Result};
use crate::kernel::schema;

/// Applies pending sequential migrations for one project
#[derive(Clone)]
pub struct SequentialRunner {
    db_pool: PgPool,
    project: String,
    catalog: Arc<MigrationCatalog>,
    registry: Arc<BatchedMigrationRegistry>,
}

impl SequentialRunner {
    pub fn new(
        db_pool: PgPool,
        project: impl Into<String>,
        catalog: Arc<MigrationCatalog>,
        registry: Arc<BatchedMigrationRegistry>,
    ) -> Self {
        Self {
            db_pool,
            project: project.into(),
            catalog,
            registry,
        }
    }

    /// Run every pending migration.
    ///
    /// Returns the ledger rows written by this run. On failure the error
    /// names the migration; earlier migrations in the run stay applied.
    pub async fn run(&self) -> Result<Vec<ExecutedMigration>> {
        schema::ensure_schema(&self.db_pool).await?;

        let executed = self.applied().await?;
        self.warn_unknown(&executed);

        let executed_timestamps: Vec<&str> =
            executed.iter().map(|m| m.timestamp.as_str()).collect();
        let to_run = migrations_to_execute(self.catalog.sequential(), &executed_timestamps);

        if to_run.is_empty() {
            info!(project = %self.project, "No migrations to run");
            return Ok(Vec::new());
        }

        info!(
            project = %self.project,
            count = to_run.len(),
            "Running migrations"
        );

        let mut applied = Vec::with_capacity(to_run.len());
        for definition in to_run {
            let record = self
                .execute(definition)
                .await
                .map_err(|source| MigrationError::MigrationFailed {
                    timestamp: definition.timestamp.clone(),
                    name: definition.name.clone(),
                    source,
                })?;
            applied.push(record);
        }

        info!(project = %self.project, count = applied.len(), "Migrations complete");
        Ok(applied)
    }

    /// Sequential migrations not yet in the ledger, in run order.
    pub async fn pending(&self) -> Result<Vec<&MigrationDefinition>> {
        schema::ensure_schema(&self.db_pool).await?;

        let executed = self.applied().await?;
        let executed_timestamps: Vec<&str> =
            executed.iter().map(|m| m.timestamp.as_str()).collect();

        Ok(migrations_to_execute(
            self.catalog.sequential(),
            &executed_timestamps,
        ))
    }

    /// Ledger rows for this project.
    pub async fn applied(&self) -> Result<Vec<ExecutedMigration>> {
        ExecutedMigration::list(&self.project, &self.db_pool).await
    }

    async fn execute(&self, definition: &MigrationDefinition) -> anyhow::Result<ExecutedMigration> {
        let body = match &definition.body {
            MigrationBody::Sequential(body) => body,
            MigrationBody::Batched(_) => anyhow::bail!(
                "batched migration {} cannot run sequentially; enqueue it instead",
                definition.name
            ),
        };

        info!(
            timestamp = %definition.timestamp,
            name = %definition.name,
            transactional = body.is_transactional(),
            "Running migration"
        );

        let record = if body.is_transactional() {
            let mut tx = self.db_pool.begin().await?;
            self.apply(body, &mut tx).await?;
            let record = ExecutedMigration::record(&self.project, definition, &mut tx).await?;
            tx.commit().await?;
            record
        } else {
            let mut conn = self.db_pool.acquire().await?;
            self.apply(body, &mut conn).await?;
            ExecutedMigration::record(&self.project, definition, &mut conn).await?
        };

        info!(
            timestamp = %definition.timestamp,
            name = %definition.name,
            "Migration applied"
        );

        Ok(record)
    }

    async fn apply(&self, body: &SequentialBody, conn: &mut PgConnection) -> anyhow::Result<()> {
        match body {
            SequentialBody::Sql(sql) => {
                sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await?;
            }
            SequentialBody::Code(migration) => {
                let mut ctx = MigrationContext::new(conn, &self.project, &self.registry);
                migration.up(&mut ctx).await?;
            }
        }
        Ok(())
    }

    fn warn_unknown(&self, executed: &[ExecutedMigration]) {
        for record in executed {
            let known = self
                .catalog
                .sequential()
                .iter()
                .any(|definition| definition.timestamp == record.timestamp);
            if known {
                continue;
            }
            warn!(
                timestamp = %record.timestamp,
                name = %record.name,
                "Ledger contains a migration missing from the catalog"
            );
        }
        debug!(count = executed.len(), "Loaded migration ledger");
    }
}
