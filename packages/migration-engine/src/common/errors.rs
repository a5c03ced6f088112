use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::batched_migrations::{BatchedMigrationJobStatus, BatchedMigrationStatus};

/// Errors surfaced by the migration engine
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Batched migration not found: {0}")]
    BatchedMigrationNotFound(Uuid),

    #[error("Batched migration job not found: {0}")]
    JobNotFound(Uuid),

    #[error("No batched migration registered with name '{0}'")]
    UnknownBatchedMigration(String),

    #[error("Cannot {action} batched migration {id} while it is {status}")]
    InvalidTransition {
        id: Uuid,
        action: &'static str,
        status: BatchedMigrationStatus,
    },

    #[error("Cannot retry job {id} while it is {status}")]
    InvalidJobTransition {
        id: Uuid,
        status: BatchedMigrationJobStatus,
    },

    #[error("Invalid batched migration parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid migration catalog: {0}")]
    InvalidCatalog(String),

    #[error("Migration {timestamp} ({name}) failed: {source:#}")]
    MigrationFailed {
        timestamp: String,
        name: String,
        source: anyhow::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = MigrationError> = std::result::Result<T, E>;

/// Failure detail stored under `data.error` on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    /// Causes below the top-level message, outermost first.
    #[serde(default)]
    pub chain: Vec<String>,
}

impl From<&anyhow::Error> for JobError {
    fn from(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            chain: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }
}
