//! Migration catalog
//!
//! The application hands the engine an explicit list of migration
//! definitions. Each definition is resolved once, at load time, into either a
//! sequential migration (SQL text or code) or a batched migration; the engine
//! never inspects files or directories.

use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::batched_migrations::BatchedMigration;
use crate::common::{MigrationError, Result};
use crate::migrations::Migration;

/// Body of a sequential migration.
#[derive(Clone)]
pub enum SequentialBody {
    /// SQL executed as one simple-protocol batch inside a transaction
    Sql(Cow<'static, str>),
    /// Arbitrary Rust code
    Code(Arc<dyn Migration>),
}

impl SequentialBody {
    /// Whether the body runs inside a single transaction with its ledger entry.
    pub fn is_transactional(&self) -> bool {
        match self {
            SequentialBody::Sql(_) => true,
            SequentialBody::Code(migration) => migration.transactional(),
        }
    }
}

/// What a catalog entry does when it runs.
#[derive(Clone)]
pub enum MigrationBody {
    Sequential(SequentialBody),
    Batched(Arc<dyn BatchedMigration>),
}

/// One migration known to the application.
///
/// Identity is the `timestamp`; `name` is descriptive only.
#[derive(Clone)]
pub struct MigrationDefinition {
    pub timestamp: String,
    pub name: String,
    pub body: MigrationBody,
}

impl MigrationDefinition {
    /// A sequential migration whose body is SQL text.
    pub fn sql(
        timestamp: impl Into<String>,
        name: impl Into<String>,
        sql: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            timestamp: timestamp.into(),
            name: name.into(),
            body: MigrationBody::Sequential(SequentialBody::Sql(sql.into())),
        }
    }

    /// A sequential migration implemented in Rust.
    pub fn code<M: Migration>(
        timestamp: impl Into<String>,
        name: impl Into<String>,
        migration: M,
    ) -> Self {
        Self {
            timestamp: timestamp.into(),
            name: name.into(),
            body: MigrationBody::Sequential(SequentialBody::Code(Arc::new(migration))),
        }
    }

    /// A batched migration, run by workers after being enqueued.
    pub fn batched<B: BatchedMigration>(
        timestamp: impl Into<String>,
        name: impl Into<String>,
        migration: B,
    ) -> Self {
        Self {
            timestamp: timestamp.into(),
            name: name.into(),
            body: MigrationBody::Batched(Arc::new(migration)),
        }
    }

    pub fn is_batched(&self) -> bool {
        matches!(self.body, MigrationBody::Batched(_))
    }
}

impl fmt::Debug for MigrationDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.body {
            MigrationBody::Sequential(SequentialBody::Sql(_)) => "sql",
            MigrationBody::Sequential(SequentialBody::Code(_)) => "code",
            MigrationBody::Batched(_) => "batched",
        };
        f.debug_struct("MigrationDefinition")
            .field("timestamp", &self.timestamp)
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

/// Ordered, immutable set of migrations for one project.
///
/// Sequential and batched migrations live in separate timestamp spaces.
/// Both lists are sorted by timestamp when the catalog is built.
#[derive(Debug, Clone, Default)]
pub struct MigrationCatalog {
    sequential: Vec<MigrationDefinition>,
    batched: Vec<MigrationDefinition>,
}

impl MigrationCatalog {
    /// Build a catalog, rejecting malformed timestamps, duplicate sequential
    /// timestamps and duplicate batched migration names.
    pub fn new(definitions: Vec<MigrationDefinition>) -> Result<Self> {
        let (mut batched, mut sequential): (Vec<_>, Vec<_>) =
            definitions.into_iter().partition(MigrationDefinition::is_batched);

        for definition in sequential.iter().chain(batched.iter()) {
            validate_timestamp(&definition.timestamp)?;
            if definition.name.trim().is_empty() {
                return Err(MigrationError::InvalidCatalog(format!(
                    "migration {} has an empty name",
                    definition.timestamp
                )));
            }
        }

        let mut seen = HashSet::new();
        for definition in &sequential {
            if !seen.insert(definition.timestamp.as_str()) {
                return Err(MigrationError::InvalidCatalog(format!(
                    "duplicate migration timestamp {}",
                    definition.timestamp
                )));
            }
        }

        let mut seen = HashSet::new();
        for definition in &batched {
            if !seen.insert(definition.name.as_str()) {
                return Err(MigrationError::InvalidCatalog(format!(
                    "duplicate batched migration name {}",
                    definition.name
                )));
            }
        }

        sequential.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        batched.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        Ok(Self {
            sequential,
            batched,
        })
    }

    /// Sequential migrations in ascending timestamp order.
    pub fn sequential(&self) -> &[MigrationDefinition] {
        &self.sequential
    }

    /// Batched migrations in ascending timestamp order.
    pub fn batched(&self) -> &[MigrationDefinition] {
        &self.batched
    }

    pub fn is_empty(&self) -> bool {
        self.sequential.is_empty() && self.batched.is_empty()
    }
}

/// Timestamps are `YYYYMMDDHHMMSS`, so they sort lexicographically.
fn validate_timestamp(timestamp: &str) -> Result<()> {
    if timestamp.len() == 14 && timestamp.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(MigrationError::InvalidCatalog(format!(
            "migration timestamp '{}' must be 14 digits (YYYYMMDDHHMMSS)",
            timestamp
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(timestamp: &str, name: &str) -> MigrationDefinition {
        MigrationDefinition::sql(timestamp, name, "SELECT 1")
    }

    #[test]
    fn catalog_sorts_sequential_migrations_by_timestamp() {
        let catalog = MigrationCatalog::new(vec![
            sql("20240301000000", "third"),
            sql("20240101000000", "first"),
            sql("20240201000000", "second"),
        ])
        .unwrap();

        let names: Vec<&str> = catalog.sequential().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn catalog_rejects_duplicate_timestamps() {
        let result = MigrationCatalog::new(vec![
            sql("20240101000000", "create_users"),
            sql("20240101000000", "create_posts"),
        ]);

        assert!(matches!(result, Err(MigrationError::InvalidCatalog(_))));
    }

    #[test]
    fn catalog_rejects_malformed_timestamps() {
        for bad in ["2024", "2024010100000a", "202401010000000", ""] {
            let result = MigrationCatalog::new(vec![sql(bad, "bad")]);
            assert!(
                matches!(result, Err(MigrationError::InvalidCatalog(_))),
                "timestamp {:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn catalog_rejects_empty_names() {
        let result = MigrationCatalog::new(vec![sql("20240101000000", "  ")]);
        assert!(matches!(result, Err(MigrationError::InvalidCatalog(_))));
    }

    #[test]
    fn empty_catalog_is_valid() {
        let catalog = MigrationCatalog::new(vec![]).unwrap();
        assert!(catalog.is_empty());
        assert!(catalog.sequential().is_empty());
    }

    #[test]
    fn sql_bodies_are_transactional() {
        let definition = sql("20240101000000", "create_users");
        match definition.body {
            MigrationBody::Sequential(body) => assert!(body.is_transactional()),
            MigrationBody::Batched(_) => panic!("expected a sequential migration"),
        }
    }
}
