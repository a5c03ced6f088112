// Common types and utilities shared across the engine

pub mod errors;

pub use errors::{JobError, MigrationError, Result};

use uuid::Uuid;

/// New primary key for engine rows (time-ordered v7).
pub fn db_id() -> Uuid {
    Uuid::now_v7()
}
