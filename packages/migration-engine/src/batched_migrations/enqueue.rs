//! Enqueueing batched migrations.
//!
//! Enqueue only records intent: a `pending` row naming a registered
//! implementation. Planning waits for the first worker to pick it up.

use sqlx::PgExecutor;
use tracing::info;

use super::model::BatchedMigrationRecord;
use super::registry::BatchedMigrationRegistry;
use super::store::BatchedMigrationStore;
use crate::common::{MigrationError, Result};

fn registered_timestamp<'r>(registry: &'r BatchedMigrationRegistry, name: &str) -> Result<&'r str> {
    registry
        .timestamp(name)
        .ok_or_else(|| MigrationError::UnknownBatchedMigration(name.to_string()))
}

/// Enqueue on a caller-supplied executor.
///
/// Used by sequential migrations so the enqueue commits or rolls back with
/// the migration's transaction.
pub async fn enqueue_batched_migration_with<'e>(
    db: impl PgExecutor<'e>,
    registry: &BatchedMigrationRegistry,
    project: &str,
    name: &str,
) -> Result<BatchedMigrationRecord> {
    let timestamp = registered_timestamp(registry, name)?;
    let migration = BatchedMigrationRecord::insert_pending(project, name, timestamp, db).await?;

    info!(
        batched_migration_id = %migration.id,
        project = %project,
        name = %name,
        "Batched migration enqueued"
    );
    Ok(migration)
}

/// Enqueue through a store. Each call creates a new instance.
pub async fn enqueue_batched_migration(
    store: &dyn BatchedMigrationStore,
    registry: &BatchedMigrationRegistry,
    project: &str,
    name: &str,
) -> Result<BatchedMigrationRecord> {
    let timestamp = registered_timestamp(registry, name)?;
    let migration = store.enqueue(project, name, timestamp).await?;

    info!(
        batched_migration_id = %migration.id,
        project = %project,
        name = %name,
        "Batched migration enqueued"
    );
    Ok(migration)
}
