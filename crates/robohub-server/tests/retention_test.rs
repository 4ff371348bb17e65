// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retention tests: expired logs, artifact files/rows and terminal runs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::TestContext;

use robohub_core::engine::RunIntent;
use robohub_core::model::{EnvName, LogLevel, RunStatus};
use robohub_core::persistence::Store;
use robohub_server::retention::{RetentionConfig, RetentionWorker};

fn aggressive_retention(store: Arc<dyn Store>) -> RetentionWorker {
    RetentionWorker::new(
        store,
        RetentionConfig {
            interval: Duration::from_secs(3600),
            run_retention_days: 1,
            log_retention_days: 1,
            artifact_retention_days: 1,
        },
    )
}

#[tokio::test]
async fn test_expired_rows_are_removed_and_fresh_ones_kept() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("retained").await;
    ctx.seed_worker("w1").await;

    // A finished run with a log line and an artifact file on disk.
    let run = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();
    ctx.engine.claim_next("w1").await.unwrap().unwrap();
    ctx.engine
        .append_log(&run.run_id, LogLevel::Info, "output")
        .await
        .unwrap();

    let artifact_path = ctx.data_dir().join("report.csv");
    tokio::fs::write(&artifact_path, "a,b\n").await.unwrap();
    ctx.engine
        .report_finish(
            &run.run_id,
            RunStatus::Success,
            None,
            &[robohub_core::engine::NewArtifact {
                name: "report.csv".to_string(),
                path: artifact_path.to_string_lossy().to_string(),
                size_bytes: 4,
                content_type: None,
            }],
        )
        .await
        .unwrap();

    let worker = aggressive_retention(ctx.store.clone() as Arc<dyn Store>);

    // Nothing is old enough today.
    let result = worker.run_cycle(Utc::now()).await.unwrap();
    assert_eq!(result.removed_runs, 0);
    assert_eq!(result.removed_log_rows, 0);
    assert_eq!(result.removed_artifact_rows, 0);
    assert!(ctx.engine.require_run(&run.run_id).await.is_ok());

    // Two days later everything expires; the file goes with the row.
    let result = worker
        .run_cycle(Utc::now() + chrono::Duration::days(2))
        .await
        .unwrap();
    assert!(result.removed_log_rows > 0);
    assert_eq!(result.removed_artifact_rows, 1);
    assert_eq!(result.removed_artifact_files, 1);
    assert_eq!(result.removed_runs, 1);
    assert!(!artifact_path.exists());
    assert!(ctx.engine.require_run(&run.run_id).await.is_err());
}

#[tokio::test]
async fn test_non_terminal_runs_survive_retention() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("long-lived").await;

    let run = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();

    let worker = aggressive_retention(ctx.store.clone() as Arc<dyn Store>);
    let result = worker
        .run_cycle(Utc::now() + chrono::Duration::days(30))
        .await
        .unwrap();

    // PENDING runs are never retention candidates, however old.
    assert_eq!(result.removed_runs, 0);
    assert!(ctx.engine.require_run(&run.run_id).await.is_ok());
}
