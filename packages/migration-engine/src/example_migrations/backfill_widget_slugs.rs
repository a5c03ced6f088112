//! Batched migration: fill `widgets.slug` from `widgets.name`
//!
//! "Blue Widget #3" becomes "blue-widget-3". Rows that already have a slug
//! are left alone, which is what makes re-running a range harmless.

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;

use crate::batched_migrations::{BatchedMigration, BatchedMigrationParameters, JobContext};

pub struct BackfillWidgetSlugs {
    db_pool: PgPool,
}

impl BackfillWidgetSlugs {
    pub const NAME: &'static str = "backfill_widget_slugs";

    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl BatchedMigration for BackfillWidgetSlugs {
    async fn get_parameters(&self) -> anyhow::Result<BatchedMigrationParameters> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM widgets")
            .fetch_one(&self.db_pool)
            .await
            .context("reading widgets id range")?;

        Ok(BatchedMigrationParameters::for_max(max))
    }

    async fn execute(&self, start: i64, end: i64, ctx: &JobContext<'_>) -> anyhow::Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE widgets
            SET slug = trim(both '-' from lower(regexp_replace(name, '[^a-zA-Z0-9]+', '-', 'g')))
            WHERE id BETWEEN $1 AND $2
              AND slug IS NULL
            "#,
        )
        .bind(start)
        .bind(end)
        .execute(&self.db_pool)
        .await
        .with_context(|| format!("updating widget slugs {}..={}", start, end))?
        .rows_affected();

        ctx.save_progress(json!({ "updated": updated })).await?;
        Ok(())
    }
}
