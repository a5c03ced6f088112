use std::collections::HashMap;
use std::sync::Arc;

use super::BatchedMigration;
use crate::catalog::{MigrationBody, MigrationCatalog};

struct RegisteredMigration {
    timestamp: String,
    migration: Arc<dyn BatchedMigration>,
}

/// Batched migration implementations by name.
///
/// Built from the catalog at startup. Records in the database refer to
/// implementations by name only; a worker skips any name it does not know.
#[derive(Default)]
pub struct BatchedMigrationRegistry {
    migrations: HashMap<String, RegisteredMigration>,
}

impl BatchedMigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: &MigrationCatalog) -> Self {
        let mut registry = Self::new();
        for definition in catalog.batched() {
            if let MigrationBody::Batched(migration) = &definition.body {
                registry.register(&definition.name, &definition.timestamp, migration.clone());
            }
        }
        registry
    }

    /// Add or replace an implementation.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        timestamp: impl Into<String>,
        migration: Arc<dyn BatchedMigration>,
    ) {
        self.migrations.insert(
            name.into(),
            RegisteredMigration {
                timestamp: timestamp.into(),
                migration,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BatchedMigration>> {
        self.migrations.get(name).map(|entry| entry.migration.clone())
    }

    pub fn timestamp(&self, name: &str) -> Option<&str> {
        self.migrations.get(name).map(|entry| entry.timestamp.as_str())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.migrations.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.migrations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
