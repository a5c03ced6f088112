// Migration Engine
//
// Evolves a live Postgres schema and backfills data without downtime.
// Sequential migrations run exactly once at deploy time; batched migrations
// split huge row-range backfills into small leased jobs that any number of
// worker processes can claim and retry.

pub mod batched_migrations;
pub mod catalog;
pub mod common;
pub mod config;
pub mod example_migrations;
pub mod kernel;
pub mod migrations;

pub use catalog::{MigrationBody, MigrationCatalog, MigrationDefinition, SequentialBody};
pub use common::{MigrationError, Result};
pub use config::*;
pub use kernel::MigrationKernel;
