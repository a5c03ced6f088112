//! Example catalog.
//!
//! A small but complete migration history for a `widgets` table, used by the
//! `migrate_cli` binary and the end-to-end tests:
//!
//! 1. `create_widgets` (SQL) creates the table
//! 2. `add_widget_slugs` (code) adds a nullable `slug` column and enqueues
//!    the backfill
//! 3. `index_widget_slugs` (code, non-transactional) builds an index
//!    concurrently
//! 4. `backfill_widget_slugs` (batched) fills `slug` in ranges of `id`
//!
//! Applications replace this with their own catalog.

mod backfill_widget_slugs;
mod widgets;

pub use backfill_widget_slugs::BackfillWidgetSlugs;
pub use widgets::{AddWidgetSlugs, IndexWidgetSlugs};

use sqlx::PgPool;

use crate::catalog::{MigrationCatalog, MigrationDefinition};
use crate::common::Result;

pub const CREATE_WIDGETS_SQL: &str = r#"
CREATE TABLE widgets (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

/// Build the example catalog. Batched migrations query through `pool`.
pub fn catalog(pool: PgPool) -> Result<MigrationCatalog> {
    MigrationCatalog::new(vec![
        MigrationDefinition::sql("20240101000000", "create_widgets", CREATE_WIDGETS_SQL),
        MigrationDefinition::code("20240102000000", "add_widget_slugs", AddWidgetSlugs),
        MigrationDefinition::code("20240103000000", "index_widget_slugs", IndexWidgetSlugs),
        MigrationDefinition::batched(
            "20240102000001",
            BackfillWidgetSlugs::NAME,
            BackfillWidgetSlugs::new(pool),
        ),
    ])
}
