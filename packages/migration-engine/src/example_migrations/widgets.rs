use async_trait::async_trait;

use super::BackfillWidgetSlugs;
use crate::migrations::{Migration, MigrationContext};

/// Adds `widgets.slug` and schedules its backfill.
pub struct AddWidgetSlugs;

#[async_trait]
impl Migration for AddWidgetSlugs {
    async fn up(&self, ctx: &mut MigrationContext<'_>) -> anyhow::Result<()> {
        sqlx::query("ALTER TABLE widgets ADD COLUMN slug TEXT")
            .execute(ctx.conn())
            .await?;

        // Same transaction: no backfill is scheduled if the column is rolled back
        ctx.enqueue_batched_migration(BackfillWidgetSlugs::NAME).await?;
        Ok(())
    }
}

/// Indexes `widgets.slug` without blocking writes.
pub struct IndexWidgetSlugs;

#[async_trait]
impl Migration for IndexWidgetSlugs {
    async fn up(&self, ctx: &mut MigrationContext<'_>) -> anyhow::Result<()> {
        sqlx::Executor::execute(
            ctx.conn(),
            sqlx::raw_sql("CREATE INDEX CONCURRENTLY IF NOT EXISTS widgets_slug_idx ON widgets (slug)"),
        )
        .await?;
        Ok(())
    }

    fn transactional(&self) -> bool {
        false
    }
}
