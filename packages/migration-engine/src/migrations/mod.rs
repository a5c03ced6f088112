//! Sequential migrations
//!
//! Ordered, one-shot schema and data changes. Each runs exactly once per
//! project and is recorded in the `migrations` ledger table.
//!
//! # Usage
//!
//! 1. Write the migration as SQL text or implement [`Migration`]
//! 2. Add it to the application's [`MigrationCatalog`](crate::MigrationCatalog)
//! 3. Run [`SequentialRunner::run`] at deploy time (`migrate_cli migrate`)
//!
//! # Example
//!
//! ```rust,ignore
//! pub struct AddWidgetSlugs;
//!
//! #[async_trait]
//! impl Migration for AddWidgetSlugs {
//!     async fn up(&self, ctx: &mut MigrationContext<'_>) -> anyhow::Result<()> {
//!         sqlx::query("ALTER TABLE widgets ADD COLUMN slug TEXT")
//!             .execute(ctx.conn())
//!             .await?;
//!
//!         // Backfill runs later, in small batches, on the workers
//!         ctx.enqueue_batched_migration("backfill_widget_slugs").await?;
//!         Ok(())
//!     }
//! }
//! ```

mod ledger;
mod runner;

pub use ledger::ExecutedMigration;
pub use runner::SequentialRunner;

use async_trait::async_trait;
use sqlx::PgConnection;

use crate::batched_migrations::{enqueue, BatchedMigrationRecord, BatchedMigrationRegistry};
use crate::catalog::MigrationDefinition;

/// A sequential migration implemented in Rust.
#[async_trait]
pub trait Migration: Send + Sync + 'static {
    /// Apply the migration.
    ///
    /// For transactional migrations the context connection is inside a
    /// transaction the runner commits together with the ledger entry. Do not
    /// commit or roll back.
    async fn up(&self, ctx: &mut MigrationContext<'_>) -> anyhow::Result<()>;

    /// Whether `up` runs inside a transaction (default: true).
    ///
    /// Operations Postgres refuses to run in a transaction (for example
    /// `CREATE INDEX CONCURRENTLY`) must return false and be idempotent.
    fn transactional(&self) -> bool {
        true
    }
}

/// Context passed to [`Migration::up`].
pub struct MigrationContext<'c> {
    conn: &'c mut PgConnection,
    project: &'c str,
    registry: &'c BatchedMigrationRegistry,
}

impl<'c> MigrationContext<'c> {
    pub(crate) fn new(
        conn: &'c mut PgConnection,
        project: &'c str,
        registry: &'c BatchedMigrationRegistry,
    ) -> Self {
        Self {
            conn,
            project,
            registry,
        }
    }

    /// Connection the migration should run its statements on.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut *self.conn
    }

    pub fn project(&self) -> &str {
        self.project
    }

    /// Schedule a registered batched migration.
    ///
    /// Runs on the migration's own connection, so from a transactional
    /// migration the enqueue commits or rolls back with it. Each call creates
    /// a new batched migration instance; a migration must never enqueue
    /// anything that leads back to itself.
    pub async fn enqueue_batched_migration(
        &mut self,
        name: &str,
    ) -> crate::Result<BatchedMigrationRecord> {
        enqueue::enqueue_batched_migration_with(&mut *self.conn, self.registry, self.project, name)
            .await
    }
}

/// Catalog entries whose timestamp is absent from `executed`.
///
/// Preserves catalog order and neither sorts nor deduplicates.
pub fn migrations_to_execute<'a, T: AsRef<str>>(
    catalog: &'a [MigrationDefinition],
    executed: &[T],
) -> Vec<&'a MigrationDefinition> {
    let executed: std::collections::HashSet<&str> =
        executed.iter().map(|timestamp| timestamp.as_ref()).collect();

    catalog
        .iter()
        .filter(|definition| !executed.contains(definition.timestamp.as_str()))
        .collect()
}
