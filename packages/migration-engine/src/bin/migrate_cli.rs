//! CLI for running and operating migrations
//!
//! Every command prints one JSON object on stdout; logs go to stderr.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use migration_engine::batched_migrations::{BatchedMigrationJobStatus, BatchedMigrationWorkerConfig};
use migration_engine::{example_migrations, Config, MigrationKernel};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "migrate_cli")]
#[command(about = "Sequential and batched migration CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending sequential migrations
    Migrate,

    /// List sequential migrations not yet applied
    Pending,

    /// List applied sequential migrations
    Applied,

    /// List batched migrations with job counts
    List,

    /// Show one batched migration
    Show { id: Uuid },

    /// List jobs of a batched migration
    Jobs {
        id: Uuid,
        #[arg(long)]
        status: Option<BatchedMigrationJobStatus>,
    },

    /// Enqueue a registered batched migration
    Enqueue { name: String },

    /// Pause a running batched migration
    Pause { id: Uuid },

    /// Resume a paused batched migration
    Resume { id: Uuid },

    /// Retry one failed job
    RetryJob { job_id: Uuid },

    /// Retry every failed job of a batched migration
    RetryFailed { id: Uuid },

    /// Work batched migration jobs
    Work {
        /// Stop once nothing is claimable instead of looping until Ctrl-C
        #[arg(long)]
        once: bool,
    },

    /// Apply migrations if configured, then work batched migrations until Ctrl-C
    Run,
}

// ============================================================================
// JSON Response
// ============================================================================

#[derive(Serialize)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct PendingMigration<'a> {
    timestamp: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct Count {
    count: u64,
}

fn output<T: Serialize>(result: migration_engine::Result<T>) -> Result<ExitCode> {
    let (response, code) = match result {
        Ok(data) => (
            Response {
                success: true,
                message: None,
                data: Some(serde_json::to_value(data)?),
            },
            ExitCode::SUCCESS,
        ),
        Err(e) => (
            Response {
                success: false,
                message: Some(e.to_string()),
                data: None,
            },
            ExitCode::FAILURE,
        ),
    };

    println!("{}", serde_json::to_string(&response)?);
    Ok(code)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,migration_engine=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;
    let kernel = build_kernel(&config).await?;

    match cli.command {
        Commands::Migrate => output(kernel.run_migrations().await),
        Commands::Pending => {
            let runner = kernel.sequential_runner();
            let pending = runner.pending().await.map(|definitions| {
                definitions
                    .into_iter()
                    .map(|d| PendingMigration {
                        timestamp: &d.timestamp,
                        name: &d.name,
                    })
                    .collect::<Vec<_>>()
            });
            output(pending)
        }
        Commands::Applied => output(kernel.sequential_runner().applied().await),
        Commands::List => output(kernel.admin().list().await),
        Commands::Show { id } => output(kernel.admin().show(id).await),
        Commands::Jobs { id, status } => output(kernel.admin().jobs(id, status).await),
        Commands::Enqueue { name } => output(kernel.admin().enqueue(&name).await),
        Commands::Pause { id } => output(kernel.admin().pause(id).await),
        Commands::Resume { id } => output(kernel.admin().resume(id).await),
        Commands::RetryJob { job_id } => output(kernel.admin().retry_job(job_id).await),
        Commands::RetryFailed { id } => output(
            kernel
                .admin()
                .retry_failed_jobs(id)
                .await
                .map(|count| Count { count }),
        ),
        Commands::Work { once } => cmd_work(&kernel, &config, once).await,
        Commands::Run => cmd_run(&kernel, &config).await,
    }
}

async fn build_kernel(config: &Config) -> Result<MigrationKernel> {
    let pool = MigrationKernel::connect(config).await?;
    tracing::info!("Database connected");

    let catalog = example_migrations::catalog(pool.clone()).context("Invalid migration catalog")?;
    let kernel = MigrationKernel::new(pool, config.project.clone(), catalog);
    kernel
        .ensure_schema()
        .await
        .context("Failed to create migration tables")?;

    Ok(kernel)
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_work(kernel: &MigrationKernel, config: &Config, once: bool) -> Result<ExitCode> {
    let worker = kernel.worker(BatchedMigrationWorkerConfig::from_config(config));

    if once {
        let jobs = worker.work_until_idle().await;
        return output(jobs.map(|jobs| Count { count: jobs as u64 }));
    }

    let handle = worker.spawn();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested; finishing current job");
    output(handle.stop().await)
}

async fn cmd_run(kernel: &MigrationKernel, config: &Config) -> Result<ExitCode> {
    if config.run_migrations {
        if let Err(e) = kernel.run_migrations().await {
            return output(Err::<(), _>(e));
        }
    } else {
        tracing::info!("RUN_MIGRATIONS disabled; skipping sequential migrations");
    }

    if !config.run_batched_migrations {
        tracing::info!("RUN_BATCHED_MIGRATIONS disabled; not starting worker");
        return output(Ok(()));
    }

    cmd_work(kernel, config, false).await
}
