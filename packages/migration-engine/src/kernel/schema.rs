//! Engine-owned tables.
//!
//! Created idempotently before the runner or workers touch them. Creation is
//! serialized with a transaction-scoped advisory lock so processes starting
//! together do not race on `CREATE TYPE`.

use sqlx::PgPool;
use tracing::debug;

use crate::common::Result;

/// Advisory lock key guarding schema creation ("migrate" in ASCII).
const SCHEMA_LOCK_KEY: i64 = 0x6d69_6772_6174_65;

const SCHEMA_SQL: &str = r#"
DO $$ BEGIN
    CREATE TYPE batched_migration_status AS ENUM ('pending', 'running', 'paused', 'failed', 'succeeded');
EXCEPTION
    WHEN duplicate_object THEN NULL;
END $$;

DO $$ BEGIN
    CREATE TYPE batched_migration_job_status AS ENUM ('pending', 'running', 'failed', 'succeeded');
EXCEPTION
    WHEN duplicate_object THEN NULL;
END $$;

CREATE TABLE IF NOT EXISTS migrations (
    id UUID PRIMARY KEY,
    project TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    name TEXT NOT NULL,
    executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (project, timestamp)
);

CREATE TABLE IF NOT EXISTS batched_migrations (
    id UUID PRIMARY KEY,
    project TEXT NOT NULL,
    name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    batch_size BIGINT CHECK (batch_size >= 1),
    min_value BIGINT,
    max_value BIGINT,
    status batched_migration_status NOT NULL DEFAULT 'pending',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS batched_migrations_project_status_idx
    ON batched_migrations (project, status, timestamp);

CREATE TABLE IF NOT EXISTS batched_migration_jobs (
    id UUID PRIMARY KEY,
    batched_migration_id UUID NOT NULL REFERENCES batched_migrations (id),
    min_value BIGINT NOT NULL,
    max_value BIGINT NOT NULL,
    status batched_migration_job_status NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    worker_id TEXT,
    lease_expires_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    data JSONB NOT NULL DEFAULT '{}'::jsonb,
    CHECK (min_value <= max_value),
    UNIQUE (batched_migration_id, min_value)
);

CREATE INDEX IF NOT EXISTS batched_migration_jobs_claim_idx
    ON batched_migration_jobs (batched_migration_id, status, min_value);
"#;

/// Create the ledger and batched migration tables if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(SCHEMA_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(SCHEMA_SQL)).await?;

    tx.commit().await?;
    debug!("Migration engine schema ready");
    Ok(())
}
