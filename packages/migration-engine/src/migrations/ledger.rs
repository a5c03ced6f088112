//! Executed-migration ledger
//!
//! Append-only record of which sequential migrations have run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgExecutor};
use uuid::Uuid;

use crate::catalog::MigrationDefinition;
use crate::common::{db_id, Result};

/// Ledger row for one executed migration
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ExecutedMigration {
    pub id: Uuid,
    pub project: String,
    pub timestamp: String,
    pub name: String,
    pub executed_at: DateTime<Utc>,
}

impl ExecutedMigration {
    /// All ledger rows for a project, oldest timestamp first
    pub async fn list<'e>(project: &str, db: impl PgExecutor<'e>) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project, timestamp, name, executed_at
            FROM migrations
            WHERE project = $1
            ORDER BY timestamp
            "#,
        )
        .bind(project)
        .fetch_all(db)
        .await
        .map_err(Into::into)
    }

    /// Append a ledger row.
    ///
    /// The `(project, timestamp)` unique constraint turns a second run of the
    /// same migration into an error instead of a duplicate record.
    pub async fn record(
        project: &str,
        definition: &MigrationDefinition,
        conn: &mut PgConnection,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO migrations (id, project, timestamp, name)
            VALUES ($1, $2, $3, $4)
            RETURNING id, project, timestamp, name, executed_at
            "#,
        )
        .bind(db_id())
        .bind(project)
        .bind(&definition.timestamp)
        .bind(&definition.name)
        .fetch_one(conn)
        .await
        .map_err(Into::into)
    }
}
