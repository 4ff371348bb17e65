// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run lifecycle tests: intake, claim, finish, cancellation, retries and
//! the watchdog paths.

mod common;

use chrono::{Duration, Utc};
use common::{TestContext, schedule_spec};

use robohub_core::engine::{NewArtifact, RunIntent};
use robohub_core::error::CoreError;
use robohub_core::model::{EnvName, LogLevel, RunStatus, TriggerType, WorkerStatus};
use robohub_core::persistence::{RunFilter, Store};

#[tokio::test]
async fn test_manual_run_success_path() {
    let ctx = TestContext::new().await;
    let (robot_id, version_id) = ctx.seed_robot("invoice-bot").await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent {
            triggered_by: Some("alice".to_string()),
            ..RunIntent::manual(&robot_id, EnvName::Prod)
        })
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Pending);
    assert_eq!(run.robot_version_id, version_id);
    assert_eq!(run.attempt, 1);
    assert!(!run.cancel_requested);

    // The intake emitted the "enqueued" line as sequence 0.
    let logs = ctx.engine.get_logs_since(&run.run_id, -1, 100).await.unwrap();
    assert_eq!(logs[0].seq, 0);
    assert_eq!(logs[0].message, "enqueued");

    let claimed = ctx.engine.claim_next("w1").await.unwrap().expect("claimable");
    assert_eq!(claimed.run.run_id, run.run_id);
    assert_eq!(claimed.run.status, RunStatus::Running);
    assert_eq!(claimed.run.claimed_by.as_deref(), Some("w1"));
    assert_eq!(claimed.version.id, version_id);

    ctx.engine
        .report_start(&run.run_id, "host-a", Some(4242))
        .await
        .unwrap();
    ctx.engine
        .append_log(&run.run_id, LogLevel::Info, "ok")
        .await
        .unwrap();

    let finished = ctx
        .engine
        .report_finish(&run.run_id, RunStatus::Success, None, &[])
        .await
        .unwrap();
    assert_eq!(finished.status, RunStatus::Success);
    assert!(finished.error_message.is_none());
    assert!(finished.duration_seconds.unwrap() >= 0.0);

    // finished_at >= started_at >= queued_at
    let started = finished.started_at.unwrap();
    let done = finished.finished_at.unwrap();
    assert!(done >= started);
    assert!(started >= finished.queued_at);

    // Queue fully drained.
    assert!(ctx.engine.claim_next("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_requires_eligible_worker() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("r").await;
    ctx.engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Test))
        .await
        .unwrap();

    // Unknown workers are rejected outright.
    assert!(matches!(
        ctx.engine.claim_next("ghost").await,
        Err(CoreError::WorkerNotFound { .. })
    ));

    // Paused workers claim nothing, and the run stays queued.
    ctx.seed_worker("w1").await;
    ctx.store
        .set_worker_status("w1", WorkerStatus::Paused)
        .await
        .unwrap();
    assert!(ctx.engine.claim_next("w1").await.unwrap().is_none());

    ctx.store
        .set_worker_status("w1", WorkerStatus::Running)
        .await
        .unwrap();
    assert!(ctx.engine.claim_next("w1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_per_robot_concurrency_cap() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("capped").await;
    ctx.seed_schedule(&robot_id, schedule_spec()).await; // max_concurrency = 1
    ctx.seed_worker("w1").await;

    let first = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();
    let second = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();

    let claimed = ctx.engine.claim_next("w1").await.unwrap().unwrap();
    assert_eq!(claimed.run.run_id, first.run_id);

    // Cap reached: the second run is deferred, not dispatched.
    assert!(ctx.engine.claim_next("w1").await.unwrap().is_none());
    let still_pending = ctx.engine.require_run(&second.run_id).await.unwrap();
    assert_eq!(still_pending.status, RunStatus::Pending);

    ctx.engine
        .report_finish(&first.run_id, RunStatus::Success, None, &[])
        .await
        .unwrap();

    let next = ctx.engine.claim_next("w1").await.unwrap().unwrap();
    assert_eq!(next.run.run_id, second.run_id);
}

#[tokio::test]
async fn test_cancel_pending_is_immediate_and_idempotent() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("r").await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Hml))
        .await
        .unwrap();

    let canceled = ctx
        .engine
        .request_cancel(&run.run_id, Some("bob"))
        .await
        .unwrap();
    assert_eq!(canceled.status, RunStatus::Canceled);
    assert_eq!(canceled.canceled_by.as_deref(), Some("bob"));
    assert!(canceled.canceled_at.is_some());
    assert!(canceled.finished_at.is_some());

    // Nothing left to claim.
    assert!(ctx.engine.claim_next("w1").await.unwrap().is_none());

    // Re-cancel is a no-op with the same final state.
    let again = ctx
        .engine
        .request_cancel(&run.run_id, Some("carol"))
        .await
        .unwrap();
    assert_eq!(again.status, RunStatus::Canceled);
    assert_eq!(again.canceled_by.as_deref(), Some("bob"));
    assert_eq!(again.canceled_at, canceled.canceled_at);
}

#[tokio::test]
async fn test_cancel_running_sets_flag_then_grace_forces() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("r").await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();
    ctx.engine.claim_next("w1").await.unwrap().unwrap();

    let flagged = ctx
        .engine
        .request_cancel(&run.run_id, Some("ops"))
        .await
        .unwrap();
    assert_eq!(flagged.status, RunStatus::Running);
    assert!(flagged.cancel_requested);
    assert!(ctx.engine.is_cancel_requested(&run.run_id).await.unwrap());

    // Within the grace period nothing is forced.
    let now = Utc::now();
    assert_eq!(ctx.engine.expire_cancel_grace(now).await.unwrap(), 0);

    // Past the grace period the run is forcibly canceled and a kill
    // signal is addressed to the owning worker.
    let later = now + Duration::seconds(ctx.engine.policy().cancel_grace_seconds + 5);
    assert_eq!(ctx.engine.expire_cancel_grace(later).await.unwrap(), 1);

    let final_run = ctx.engine.require_run(&run.run_id).await.unwrap();
    assert_eq!(final_run.status, RunStatus::Canceled);
    assert_eq!(final_run.canceled_by.as_deref(), Some("ops"));

    let kills = ctx.engine.queue().take_kills("w1").await.unwrap();
    assert_eq!(kills, vec![run.run_id.clone()]);
}

#[tokio::test]
async fn test_failed_scheduled_run_spawns_retry() {
    let ctx = TestContext::new().await;
    let (robot_id, version_id) = ctx.seed_robot("flaky").await;
    let schedule_id = ctx
        .seed_schedule(
            &robot_id,
            robohub_core::persistence::ScheduleSpec {
                retry_count: 1,
                retry_backoff_seconds: 1,
                ..schedule_spec()
            },
        )
        .await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent {
            trigger_type: TriggerType::Scheduled,
            schedule_id: Some(schedule_id.clone()),
            fire_time: Some(Utc::now()),
            ..RunIntent::manual(&robot_id, EnvName::Prod)
        })
        .await
        .unwrap();

    ctx.engine.claim_next("w1").await.unwrap().unwrap();
    ctx.engine
        .report_finish(&run.run_id, RunStatus::Failed, Some("exit code 2"), &[])
        .await
        .unwrap();

    let retries = ctx
        .store
        .list_runs(&RunFilter {
            robot_id: Some(robot_id.clone()),
            trigger_type: Some(TriggerType::Retry),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(retries.len(), 1);
    let retry = &retries[0];
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.robot_version_id, version_id);
    assert_eq!(retry.env_name, EnvName::Prod);
    assert_eq!(retry.schedule_id.as_deref(), Some(schedule_id.as_str()));

    // Backoff: the retry is not claimable until not_before elapses.
    assert!(ctx.engine.claim_next("w1").await.unwrap().is_none());
    tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
    let claimed = ctx.engine.claim_next("w1").await.unwrap().unwrap();
    assert_eq!(claimed.run.run_id, retry.run_id);

    // Exhausted budget: a second failure does not spawn attempt 3.
    ctx.engine
        .report_finish(&retry.run_id, RunStatus::Failed, Some("exit code 2"), &[])
        .await
        .unwrap();
    let retries = ctx
        .store
        .list_runs(&RunFilter {
            robot_id: Some(robot_id),
            trigger_type: Some(TriggerType::Retry),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(retries.len(), 1, "retry budget of 1 was already spent");
}

#[tokio::test]
async fn test_manual_runs_never_retry() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("manual").await;
    ctx.seed_schedule(
        &robot_id,
        robohub_core::persistence::ScheduleSpec {
            retry_count: 3,
            ..schedule_spec()
        },
    )
    .await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();
    ctx.engine.claim_next("w1").await.unwrap().unwrap();
    ctx.engine
        .report_finish(&run.run_id, RunStatus::Failed, Some("exit code 1"), &[])
        .await
        .unwrap();

    let retries = ctx
        .store
        .list_runs(&RunFilter {
            trigger_type: Some(TriggerType::Retry),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(retries.is_empty());
}

#[tokio::test]
async fn test_finish_is_only_valid_from_running() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("r").await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();

    // PENDING runs cannot finish.
    assert!(matches!(
        ctx.engine
            .report_finish(&run.run_id, RunStatus::Success, None, &[])
            .await,
        Err(CoreError::InvalidRunState { .. })
    ));

    ctx.engine.claim_next("w1").await.unwrap().unwrap();
    ctx.engine
        .report_finish(&run.run_id, RunStatus::Success, None, &[])
        .await
        .unwrap();

    // Terminal states are sticky: a second finish is rejected and the
    // recorded outcome survives.
    assert!(matches!(
        ctx.engine
            .report_finish(&run.run_id, RunStatus::Failed, Some("late"), &[])
            .await,
        Err(CoreError::InvalidRunState { .. })
    ));
    let still = ctx.engine.require_run(&run.run_id).await.unwrap();
    assert_eq!(still.status, RunStatus::Success);
}

#[tokio::test]
async fn test_post_terminal_logs_are_tagged() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("r").await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();
    ctx.engine.claim_next("w1").await.unwrap().unwrap();
    ctx.engine
        .report_finish(&run.run_id, RunStatus::Success, None, &[])
        .await
        .unwrap();

    let late = ctx
        .engine
        .append_log(&run.run_id, LogLevel::Error, "buffered stderr flush")
        .await
        .unwrap();
    assert!(late.post_terminal);

    // Sequences stay monotonic across the terminal boundary.
    let logs = ctx.engine.get_logs_since(&run.run_id, -1, 100).await.unwrap();
    let seqs: Vec<i64> = logs.iter().map(|l| l.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(seqs, sorted);

    // And the run did not reopen.
    let run = ctx.engine.require_run(&run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn test_duplicate_fire_is_rejected() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("cron-bot").await;
    let schedule_id = ctx.seed_schedule(&robot_id, schedule_spec()).await;
    let fire_time = Utc::now();

    let intent = RunIntent {
        trigger_type: TriggerType::Scheduled,
        schedule_id: Some(schedule_id),
        fire_time: Some(fire_time),
        ..RunIntent::manual(&robot_id, EnvName::Prod)
    };
    ctx.engine.create_run(intent.clone()).await.unwrap();
    assert!(matches!(
        ctx.engine.create_run(intent).await,
        Err(CoreError::DuplicateFire { .. })
    ));
}

#[tokio::test]
async fn test_create_run_validations() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("r").await;

    assert!(matches!(
        ctx.engine
            .create_run(RunIntent::manual("no-such-robot", EnvName::Prod))
            .await,
        Err(CoreError::RobotNotFound { .. })
    ));

    let bare = ctx.store.create_robot("no-version", None, &[]).await.unwrap();
    assert!(matches!(
        ctx.engine
            .create_run(RunIntent::manual(&bare.id, EnvName::Prod))
            .await,
        Err(CoreError::NoActiveVersion { .. })
    ));

    assert!(matches!(
        ctx.engine
            .create_run(RunIntent {
                trigger_type: TriggerType::Scheduled,
                ..RunIntent::manual(&robot_id, EnvName::Prod)
            })
            .await,
        Err(CoreError::ValidationError { .. })
    ));

    assert!(matches!(
        ctx.engine
            .create_run(RunIntent {
                trigger_type: TriggerType::Retry,
                attempt: 1,
                ..RunIntent::manual(&robot_id, EnvName::Prod)
            })
            .await,
        Err(CoreError::ValidationError { .. })
    ));
}

#[tokio::test]
async fn test_dispatch_fatal_fails_pending_run() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("r").await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();
    ctx.engine
        .fail_dispatch(&run.run_id, "MissingRequiredEnv: API_KEY")
        .await
        .unwrap();

    let failed = ctx.engine.require_run(&run.run_id).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("MissingRequiredEnv: API_KEY")
    );
    assert!(ctx.engine.claim_next("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_watchdog_times_out_overdue_runs() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("sleeper").await;
    let schedule_id = ctx
        .seed_schedule(
            &robot_id,
            robohub_core::persistence::ScheduleSpec {
                timeout_seconds: 2,
                ..schedule_spec()
            },
        )
        .await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent {
            trigger_type: TriggerType::Scheduled,
            schedule_id: Some(schedule_id),
            fire_time: Some(Utc::now()),
            ..RunIntent::manual(&robot_id, EnvName::Prod)
        })
        .await
        .unwrap();
    ctx.engine.claim_next("w1").await.unwrap().unwrap();
    ctx.engine
        .report_start(&run.run_id, "host-a", Some(1))
        .await
        .unwrap();

    // Not yet overdue.
    assert_eq!(ctx.engine.expire_timed_out_runs(Utc::now()).await.unwrap(), 0);

    let margin = ctx.engine.policy().watchdog_margin_seconds;
    let later = Utc::now() + Duration::seconds(2 + margin + 5);
    assert_eq!(ctx.engine.expire_timed_out_runs(later).await.unwrap(), 1);

    let failed = ctx.engine.require_run(&run.run_id).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("TIMEOUT"));
}

#[tokio::test]
async fn test_runs_of_lost_workers_are_failed() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("r").await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();
    ctx.engine.claim_next("w1").await.unwrap().unwrap();

    let stale = ctx.engine.policy().worker_stale_seconds;
    let later = Utc::now() + Duration::seconds(stale * 2 + 10);
    assert_eq!(ctx.engine.fail_runs_of_lost_workers(later).await.unwrap(), 1);

    let failed = ctx.engine.require_run(&run.run_id).await.unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("worker lost"));
}

#[tokio::test]
async fn test_artifacts_recorded_at_finish() {
    let ctx = TestContext::new().await;
    let (robot_id, _) = ctx.seed_robot("r").await;
    ctx.seed_worker("w1").await;

    let run = ctx
        .engine
        .create_run(RunIntent::manual(&robot_id, EnvName::Prod))
        .await
        .unwrap();
    ctx.engine.claim_next("w1").await.unwrap().unwrap();

    ctx.engine
        .report_finish(
            &run.run_id,
            RunStatus::Success,
            None,
            &[NewArtifact {
                name: "report.csv".to_string(),
                path: "/data/runs/x/output/report.csv".to_string(),
                size_bytes: 128,
                content_type: Some("text/csv".to_string()),
            }],
        )
        .await
        .unwrap();

    let artifacts = ctx.store.list_artifacts(&run.run_id).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].name, "report.csv");
    assert_eq!(artifacts[0].size_bytes, 128);
}
