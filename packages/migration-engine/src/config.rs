use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Namespace for ledger and batched migration rows
    pub project: String,
    pub run_migrations: bool,
    pub run_batched_migrations: bool,
    /// How long one worker iteration keeps claiming jobs before sleeping
    pub batched_migrations_work_duration: Duration,
    /// How long the worker sleeps between iterations
    pub batched_migrations_sleep_duration: Duration,
    /// How long a claimed job may go without a heartbeat before it is reclaimed
    pub batched_migrations_lease_duration: Duration,
    pub batched_migrations_heartbeat_interval: Duration,
    /// Attempts per job before it stays failed (1 = no automatic retry)
    pub batched_migrations_max_attempts: i32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 10)?,
            project: env::var("MIGRATIONS_PROJECT").unwrap_or_else(|_| "default".to_string()),
            run_migrations: parse_var("RUN_MIGRATIONS", true)?,
            run_batched_migrations: parse_var("RUN_BATCHED_MIGRATIONS", true)?,
            batched_migrations_work_duration: Duration::from_millis(parse_var(
                "BATCHED_MIGRATIONS_WORK_DURATION_MS",
                60_000,
            )?),
            batched_migrations_sleep_duration: Duration::from_millis(parse_var(
                "BATCHED_MIGRATIONS_SLEEP_DURATION_MS",
                30_000,
            )?),
            batched_migrations_lease_duration: Duration::from_millis(parse_var(
                "BATCHED_MIGRATIONS_LEASE_DURATION_MS",
                300_000,
            )?),
            batched_migrations_heartbeat_interval: Duration::from_millis(parse_var(
                "BATCHED_MIGRATIONS_HEARTBEAT_INTERVAL_MS",
                30_000,
            )?),
            batched_migrations_max_attempts: parse_var("BATCHED_MIGRATIONS_MAX_ATTEMPTS", 1)?,
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} must be a valid value (got '{}')", name, value)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_var_uses_default_when_unset() {
        let value: u64 = parse_var("MIGRATION_ENGINE_TEST_UNSET_VAR", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn parse_var_parses_set_value() {
        env::set_var("MIGRATION_ENGINE_TEST_MAX_ATTEMPTS", "3");
        let value: i32 = parse_var("MIGRATION_ENGINE_TEST_MAX_ATTEMPTS", 1).unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn parse_var_rejects_garbage() {
        env::set_var("MIGRATION_ENGINE_TEST_FLAG", "sometimes");
        let err = parse_var::<bool>("MIGRATION_ENGINE_TEST_FLAG", true).unwrap_err();
        assert!(err.to_string().contains("MIGRATION_ENGINE_TEST_FLAG"));
    }
}
