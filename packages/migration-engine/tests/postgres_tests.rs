//! Integration tests against a real Postgres.
//!
//! Run with: cargo test --test postgres_tests
//!
//! Requires Docker for the testcontainers Postgres.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::*;
use migration_engine::batched_migrations::{
    BatchedMigrationJobStatus, BatchedMigrationParameters, BatchedMigrationStatus,
    BatchedMigrationStore, StartOutcome,
};
use migration_engine::{example_migrations, MigrationCatalog, MigrationDefinition, MigrationError};
use test_context::test_context;

const BACKFILL: &str = "backfill";

fn create_table_sql(table: &str) -> String {
    format!("CREATE TABLE {} (id BIGSERIAL PRIMARY KEY)", table)
}

// =============================================================================
// Sequential runner
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn runner_applies_each_migration_once(ctx: &TestHarness) {
    let first = ctx.table("first");
    let second = ctx.table("second");
    let catalog = MigrationCatalog::new(vec![
        MigrationDefinition::sql("20240102000000", "create_second", create_table_sql(&second)),
        MigrationDefinition::sql("20240101000000", "create_first", create_table_sql(&first)),
    ])
    .unwrap();
    let kernel = ctx.kernel(catalog);

    let runner = kernel.sequential_runner();
    assert_eq!(runner.pending().await.unwrap().len(), 2);

    let applied = kernel.run_migrations().await.unwrap();
    let timestamps: Vec<_> = applied.iter().map(|m| m.timestamp.as_str()).collect();
    assert_eq!(timestamps, vec!["20240101000000", "20240102000000"]);
    assert!(ctx.table_exists(&first).await.unwrap());
    assert!(ctx.table_exists(&second).await.unwrap());

    let rerun = kernel.run_migrations().await.unwrap();
    assert!(rerun.is_empty());
    assert!(runner.pending().await.unwrap().is_empty());

    let ledger = runner.applied().await.unwrap();
    assert_eq!(ledger.len(), 2);
    assert!(ledger.iter().all(|m| m.project == ctx.project));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn runner_only_applies_new_catalog_entries(ctx: &TestHarness) {
    let first = ctx.table("first");
    let later = ctx.table("later");

    let initial = MigrationCatalog::new(vec![MigrationDefinition::sql(
        "20240101000000",
        "create_first",
        create_table_sql(&first),
    )])
    .unwrap();
    ctx.kernel(initial).run_migrations().await.unwrap();

    let grown = MigrationCatalog::new(vec![
        MigrationDefinition::sql("20240101000000", "create_first", create_table_sql(&first)),
        MigrationDefinition::sql("20240201000000", "create_later", create_table_sql(&later)),
    ])
    .unwrap();
    let applied = ctx.kernel(grown).run_migrations().await.unwrap();

    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].name, "create_later");
    assert!(ctx.table_exists(&later).await.unwrap());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn failing_migration_halts_the_run_and_rolls_back(ctx: &TestHarness) {
    let first = ctx.table("first");
    let broken = ctx.table("broken");
    let last = ctx.table("last");
    let catalog = MigrationCatalog::new(vec![
        MigrationDefinition::sql("20240101000000", "create_first", create_table_sql(&first)),
        MigrationDefinition::sql(
            "20240102000000",
            "create_broken",
            format!(
                "{}; SELECT * FROM {}_does_not_exist",
                create_table_sql(&broken),
                ctx.project
            ),
        ),
        MigrationDefinition::sql("20240103000000", "create_last", create_table_sql(&last)),
    ])
    .unwrap();
    let kernel = ctx.kernel(catalog);

    let err = kernel.run_migrations().await.unwrap_err();

    match err {
        MigrationError::MigrationFailed { timestamp, name, .. } => {
            assert_eq!(timestamp, "20240102000000");
            assert_eq!(name, "create_broken");
        }
        other => panic!("expected MigrationFailed, got {:?}", other),
    }
    assert!(ctx.table_exists(&first).await.unwrap());
    assert!(!ctx.table_exists(&broken).await.unwrap(), "failed migration rolled back");
    assert!(!ctx.table_exists(&last).await.unwrap(), "run halted");

    let ledger = kernel.sequential_runner().applied().await.unwrap();
    let timestamps: Vec<_> = ledger.iter().map(|m| m.timestamp.as_str()).collect();
    assert_eq!(timestamps, vec!["20240101000000"]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn enqueue_commits_with_the_migration(ctx: &TestHarness) {
    let migration = RecordingMigration::new(1, 10, 10);
    let catalog = MigrationCatalog::new(vec![
        MigrationDefinition::code(
            "20240101000000",
            "add_column",
            EnqueueBackfill {
                batched_name: BACKFILL,
                fail_after_enqueue: false,
            },
        ),
        MigrationDefinition::batched(TIMESTAMP, BACKFILL, Recorded(migration.clone())),
    ])
    .unwrap();
    let kernel = ctx.kernel(catalog);

    kernel.run_migrations().await.unwrap();

    let batched = kernel.admin().list().await.unwrap();
    assert_eq!(batched.len(), 1);
    assert_eq!(batched[0].migration.name, BACKFILL);
    assert_eq!(batched[0].migration.status, BatchedMigrationStatus::Pending);

    let jobs = kernel
        .worker(test_worker_config(&ctx.project, 1))
        .work_until_idle()
        .await
        .unwrap();
    assert_eq!(jobs, 1);
    assert_eq!(migration.executed(), vec![(1, 10)]);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn enqueue_rolls_back_with_a_failed_migration(ctx: &TestHarness) {
    let catalog = MigrationCatalog::new(vec![
        MigrationDefinition::code(
            "20240101000000",
            "add_column",
            EnqueueBackfill {
                batched_name: BACKFILL,
                fail_after_enqueue: true,
            },
        ),
        MigrationDefinition::batched(
            TIMESTAMP,
            BACKFILL,
            Recorded(RecordingMigration::new(1, 10, 10)),
        ),
    ])
    .unwrap();
    let kernel = ctx.kernel(catalog);

    assert!(kernel.run_migrations().await.is_err());

    assert!(kernel.admin().list().await.unwrap().is_empty());
    assert!(kernel.sequential_runner().applied().await.unwrap().is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn enqueueing_an_unregistered_name_fails_the_migration(ctx: &TestHarness) {
    let catalog = MigrationCatalog::new(vec![MigrationDefinition::code(
        "20240101000000",
        "add_column",
        EnqueueBackfill {
            batched_name: "not_registered",
            fail_after_enqueue: false,
        },
    )])
    .unwrap();
    let kernel = ctx.kernel(catalog);

    let err = kernel.run_migrations().await.unwrap_err();

    assert!(matches!(err, MigrationError::MigrationFailed { .. }));
    assert!(kernel.sequential_runner().applied().await.unwrap().is_empty());
}

// =============================================================================
// Batched migration store
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_starts_plan_exactly_once(ctx: &TestHarness) {
    let store = ctx.store();
    let migration = store.enqueue(&ctx.project, BACKFILL, TIMESTAMP).await.unwrap();
    let params = BatchedMigrationParameters::new(1, 2500, 1000);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            let id = migration.id;
            tokio::spawn(async move { store.start(id, &params).await })
        })
        .collect();

    let mut planned = 0;
    for handle in handles {
        if let StartOutcome::Planned { job_count, .. } = handle.await.unwrap().unwrap() {
            assert_eq!(job_count, 3);
            planned += 1;
        }
    }
    assert_eq!(planned, 1);

    let jobs = store.list_jobs(migration.id, None).await.unwrap();
    let ranges: Vec<_> = jobs.iter().map(|j| (j.min_value, j.max_value)).collect();
    assert_eq!(ranges, vec![(1, 1000), (1001, 2000), (2001, 2500)]);
    assert!(jobs.iter().all(|j| j.status == BatchedMigrationJobStatus::Pending));

    let migration = store.find(migration.id).await.unwrap();
    assert_eq!(migration.status, BatchedMigrationStatus::Running);
    assert_eq!(migration.batch_size, Some(1000));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn empty_range_is_succeeded_at_start(ctx: &TestHarness) {
    let store = ctx.store();
    let migration = store.enqueue(&ctx.project, BACKFILL, TIMESTAMP).await.unwrap();

    let outcome = store
        .start(migration.id, &BatchedMigrationParameters::for_max(None))
        .await
        .unwrap();

    assert!(matches!(outcome, StartOutcome::Empty(_)));
    assert_eq!(outcome.migration().status, BatchedMigrationStatus::Succeeded);
    assert_eq!(store.job_counts(migration.id).await.unwrap().total(), 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn concurrent_claims_are_exclusive(ctx: &TestHarness) {
    let store = ctx.store();
    let migration = store.enqueue(&ctx.project, BACKFILL, TIMESTAMP).await.unwrap();
    store
        .start(migration.id, &BatchedMigrationParameters::new(1, 500, 10))
        .await
        .unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            let id = migration.id;
            tokio::spawn(async move {
                let worker_id = format!("w{}", i);
                let mut claimed = Vec::new();
                while let Some(job) = store
                    .claim_next_job(id, &worker_id, Duration::from_secs(30))
                    .await
                    .unwrap()
                {
                    assert_eq!(job.worker_id.as_deref(), Some(worker_id.as_str()));
                    claimed.push(job.id);
                }
                claimed
            })
        })
        .collect();

    let mut claimed = Vec::new();
    for handle in handles {
        claimed.extend(handle.await.unwrap());
    }

    let unique: HashSet<_> = claimed.iter().collect();
    assert_eq!(claimed.len(), 50);
    assert_eq!(unique.len(), 50);

    let counts = store.job_counts(migration.id).await.unwrap();
    assert_eq!(counts.running, 50);
    assert_eq!(counts.pending, 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn expired_lease_is_reclaimed_and_old_worker_is_fenced(ctx: &TestHarness) {
    let migration_impl = RecordingMigration::new(1, 10, 10);
    let registry = registry_with(BACKFILL, migration_impl.clone());
    let store = ctx.store();
    let migration = store.enqueue(&ctx.project, BACKFILL, TIMESTAMP).await.unwrap();
    store
        .start(migration.id, &BatchedMigrationParameters::new(1, 10, 10))
        .await
        .unwrap();

    let job = store
        .claim_next_job(migration.id, "dead-worker", Duration::from_millis(1))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let worker = ctx.worker(registry, 1);
    assert_eq!(worker.work_until_idle().await.unwrap(), 1);
    assert_eq!(migration_impl.attempts(), vec![(1, 2)]);

    assert!(!store.heartbeat(job.id, "dead-worker", Duration::from_secs(30)).await.unwrap());
    assert!(!store.mark_job_succeeded(job.id, "dead-worker").await.unwrap());

    let job = store.find_job(job.id).await.unwrap();
    assert_eq!(job.status, BatchedMigrationJobStatus::Succeeded);
    assert_eq!(job.worker_id.as_deref(), Some(worker.config().worker_id.as_str()));
    assert_eq!(
        store.find(migration.id).await.unwrap().status,
        BatchedMigrationStatus::Succeeded
    );
}

// =============================================================================
// Worker and operator surface
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn failed_job_is_isolated_and_retry_completes_the_migration(ctx: &TestHarness) {
    let migration_impl = RecordingMigration::new(1, 2500, 1000);
    migration_impl.fail_range(1001, 1);
    let registry = registry_with(BACKFILL, migration_impl.clone());
    let admin = migration_engine::batched_migrations::BatchedMigrationAdmin::new(
        ctx.store(),
        registry.clone(),
        ctx.project.clone(),
    );
    let worker = ctx.worker(registry, 1);

    let migration = admin.enqueue(BACKFILL).await.unwrap();
    assert_eq!(worker.work_until_idle().await.unwrap(), 3);

    let summary = admin.show(migration.id).await.unwrap();
    assert_eq!(summary.migration.status, BatchedMigrationStatus::Failed);
    assert_eq!(summary.jobs.failed, 1);
    assert_eq!(summary.jobs.succeeded, 2);

    let failed = admin
        .jobs(migration.id, Some(BatchedMigrationJobStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!((failed[0].min_value, failed[0].max_value), (1001, 2000));
    assert!(failed[0].error().unwrap().message.contains("exploded"));

    assert_eq!(admin.retry_failed_jobs(migration.id).await.unwrap(), 1);
    assert_eq!(
        admin.show(migration.id).await.unwrap().migration.status,
        BatchedMigrationStatus::Running
    );
    assert_eq!(worker.work_until_idle().await.unwrap(), 1);

    let summary = admin.show(migration.id).await.unwrap();
    assert_eq!(summary.migration.status, BatchedMigrationStatus::Succeeded);
    assert_eq!(summary.jobs.succeeded, 3);
    let retried = admin.jobs(migration.id, None).await.unwrap();
    assert!(retried.iter().all(|j| j.error().is_none()));
    assert!(retried.iter().all(|j| j.attempts == 1), "operator retry resets attempts");
    assert_eq!(
        migration_impl.executed(),
        vec![(1, 1000), (1001, 2000), (2001, 2500)]
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn admin_transitions_are_validated(ctx: &TestHarness) {
    let migration_impl = RecordingMigration::new(1, 20, 10);
    let registry = registry_with(BACKFILL, migration_impl.clone());
    let admin = migration_engine::batched_migrations::BatchedMigrationAdmin::new(
        ctx.store(),
        registry.clone(),
        ctx.project.clone(),
    );
    let store = ctx.store();

    let migration = admin.enqueue(BACKFILL).await.unwrap();
    let err = admin.pause(migration.id).await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::InvalidTransition {
            status: BatchedMigrationStatus::Pending,
            ..
        }
    ));

    store
        .start(migration.id, &BatchedMigrationParameters::new(1, 20, 10))
        .await
        .unwrap();
    admin.pause(migration.id).await.unwrap();
    assert!(admin.pause(migration.id).await.is_err());

    let worker = ctx.worker(registry, 1);
    assert_eq!(worker.work_until_idle().await.unwrap(), 0);

    let jobs = admin.jobs(migration.id, None).await.unwrap();
    let err = admin.retry_job(jobs[0].id).await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::InvalidJobTransition {
            status: BatchedMigrationJobStatus::Pending,
            ..
        }
    ));

    admin.resume(migration.id).await.unwrap();
    assert_eq!(worker.work_until_idle().await.unwrap(), 2);
    assert_eq!(
        admin.show(migration.id).await.unwrap().migration.status,
        BatchedMigrationStatus::Succeeded
    );

    assert!(matches!(
        admin.show(uuid::Uuid::now_v7()).await,
        Err(MigrationError::BatchedMigrationNotFound(_))
    ));
    assert!(matches!(
        admin.enqueue("not_registered").await,
        Err(MigrationError::UnknownBatchedMigration(_))
    ));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn workers_in_parallel_cover_every_batch_once(ctx: &TestHarness) {
    let migration_impl = RecordingMigration::new(1, 200, 10);
    let registry = registry_with(BACKFILL, migration_impl.clone());
    let store = ctx.store();
    let migration = store.enqueue(&ctx.project, BACKFILL, TIMESTAMP).await.unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let worker = ctx.worker(registry.clone(), 1);
            tokio::spawn(async move { worker.work_until_idle().await })
        })
        .collect();

    let mut total = 0;
    for worker in workers {
        total += worker.await.unwrap().unwrap();
    }

    assert_eq!(total, 20);
    let executed = migration_impl.executed();
    assert_eq!(executed.len(), 20);
    assert_eq!(executed.first(), Some(&(1, 10)));
    assert_eq!(executed.last(), Some(&(191, 200)));
    assert_eq!(
        store.find(migration.id).await.unwrap().status,
        BatchedMigrationStatus::Succeeded
    );
}

// =============================================================================
// Example catalog
// =============================================================================

// The only test touching the global `widgets` table.
#[test_context(TestHarness)]
#[tokio::test]
async fn example_catalog_migrates_and_backfills_widgets(ctx: &TestHarness) {
    let catalog = example_migrations::catalog(ctx.db_pool.clone()).unwrap();
    let kernel = ctx.kernel(catalog);

    let applied = kernel.run_migrations().await.unwrap();
    let names: Vec<_> = applied.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["create_widgets", "add_widget_slugs", "index_widget_slugs"]
    );

    sqlx::query("INSERT INTO widgets (name) VALUES ('Blue Widget 3'), ('  Fancy -- Gadget!'), ('x')")
        .execute(&ctx.db_pool)
        .await
        .unwrap();

    let batched = kernel.admin().list().await.unwrap();
    assert_eq!(batched.len(), 1);
    assert_eq!(batched[0].migration.name, example_migrations::BackfillWidgetSlugs::NAME);

    let jobs = kernel
        .worker(test_worker_config(&ctx.project, 1))
        .work_until_idle()
        .await
        .unwrap();
    assert_eq!(jobs, 1);

    let slugs: Vec<String> = sqlx::query_scalar("SELECT slug FROM widgets ORDER BY id")
        .fetch_all(&ctx.db_pool)
        .await
        .unwrap();
    assert_eq!(slugs, vec!["blue-widget-3", "fancy-gadget", "x"]);

    let summary = kernel.admin().show(batched[0].migration.id).await.unwrap();
    assert_eq!(summary.migration.status, BatchedMigrationStatus::Succeeded);
    let job = &kernel.admin().jobs(summary.migration.id, None).await.unwrap()[0];
    assert_eq!(job.progress(), Some(&serde_json::json!({ "updated": 3 })));

    let index_exists = ctx.table_exists("widgets_slug_idx").await.unwrap();
    assert!(index_exists);
    assert!(kernel.run_migrations().await.unwrap().is_empty());

}
