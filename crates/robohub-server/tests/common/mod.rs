// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for robohub-server integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use uuid::Uuid;

use robohub_core::blobstore::BlobStore;
use robohub_core::cipher::Cipher;
use robohub_core::config::CoreConfig;
use robohub_core::engine::{EnginePolicy, RunEngine};
use robohub_core::model::{ArtifactKind, Channel, EntrypointKind};
use robohub_core::persistence::{NewVersion, ScheduleSpec, SqliteStore, Store};

use robohub_server::config::ServerConfig;
use robohub_server::http::{AppState, build_router};
use robohub_server::scheduler::{Scheduler, SchedulerConfig};
use robohub_server::sla_monitor::{SlaMonitor, SlaMonitorConfig};

pub const TEST_API_TOKEN: &str = "test-api-token";
pub const TEST_DEPLOY_TOKEN: &str = "test-deploy-token";

/// Test context owning the database, engine, loops and router.
pub struct TestContext {
    pub store: Arc<SqliteStore>,
    pub engine: Arc<RunEngine>,
    pub scheduler: Scheduler,
    pub sla_monitor: SlaMonitor,
    pub cipher: Cipher,
    pub app: axum::Router,
    _dir: TempDir,
}

impl TestContext {
    pub async fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let core_config = CoreConfig {
            database_url: "ignored".to_string(),
            app_timezone: "UTC".to_string(),
            data_dir: dir.path().to_path_buf(),
            scheduler_interval: Duration::from_secs(30),
            sla_monitor_interval: Duration::from_secs(60),
            queue_backlog_alert_threshold: 5,
            worker_stale_seconds: 180,
            failure_streak_threshold: 3,
            default_manual_timeout_seconds: 3600,
            cancel_grace_seconds: 30,
            watchdog_margin_seconds: 15,
            run_retention_days: 90,
            log_retention_days: 30,
            artifact_retention_days: 30,
            cleanup_interval: Duration::from_secs(3600),
        };

        let store = Arc::new(
            SqliteStore::from_path(dir.path().join("hub.db"))
                .await
                .expect("open test database"),
        );
        let engine = Arc::new(RunEngine::new(
            store.clone() as Arc<dyn Store>,
            EnginePolicy::from(&core_config),
        ));
        let cipher = Cipher::new("server-test-key").unwrap();

        let scheduler = Scheduler::new(
            engine.clone(),
            SchedulerConfig {
                interval: core_config.scheduler_interval,
                app_timezone: core_config.app_timezone.clone(),
            },
        );
        let sla_monitor = SlaMonitor::new(
            engine.clone(),
            SlaMonitorConfig {
                interval: core_config.sla_monitor_interval,
                app_timezone: core_config.app_timezone.clone(),
                queue_backlog_threshold: core_config.queue_backlog_alert_threshold,
                worker_stale_seconds: core_config.worker_stale_seconds,
                failure_streak_threshold: core_config.failure_streak_threshold,
            },
        );

        let state = AppState {
            engine: engine.clone(),
            store: store.clone() as Arc<dyn Store>,
            cipher: cipher.clone(),
            blobstore: BlobStore::new(dir.path()),
            core_config,
            server_config: ServerConfig {
                http_addr: ([127, 0, 0, 1], 0).into(),
                api_token: Some(TEST_API_TOKEN.to_string()),
                deploy_token: Some(TEST_DEPLOY_TOKEN.to_string()),
            },
            started_at: Instant::now(),
        };
        let app = build_router(state);

        Self {
            store,
            engine,
            scheduler,
            sla_monitor,
            cipher,
            app,
            _dir: dir,
        }
    }

    /// Scratch directory backing this context's blob store and data dir.
    pub fn data_dir(&self) -> &std::path::Path {
        self._dir.path()
    }

    /// Create a robot with one active version; returns (robot_id, version_id).
    pub async fn seed_robot(&self, name: &str) -> (String, String) {
        let robot = self
            .store
            .create_robot(name, None, &[])
            .await
            .expect("create robot");
        let version = self
            .store
            .insert_version(&NewVersion {
                id: Uuid::new_v4().to_string(),
                robot_id: robot.id.clone(),
                version: "1.0.0".to_string(),
                channel: Channel::Stable,
                artifact_kind: ArtifactKind::Exe,
                artifact_digest: "0".repeat(64),
                entrypoint_kind: EntrypointKind::Binary,
                entrypoint_path: "robot".to_string(),
                default_arguments: Vec::new(),
                default_env: HashMap::new(),
                working_dir: None,
                required_env_keys: Vec::new(),
                changelog: None,
                commit_sha: None,
                branch: None,
                build_url: None,
                created_source: "user".to_string(),
                is_active: true,
            })
            .await
            .expect("insert version");
        (robot.id, version.id)
    }

    pub async fn seed_schedule(&self, robot_id: &str, spec: ScheduleSpec) -> String {
        self.store
            .create_schedule(robot_id, &spec)
            .await
            .expect("create schedule")
            .id
    }

    pub async fn seed_worker(&self, worker_id: &str) {
        self.store
            .upsert_worker_heartbeat(worker_id, "test-host", None, chrono::Utc::now())
            .await
            .expect("register worker");
    }
}

/// A permissive schedule spec used as a baseline in tests.
pub fn schedule_spec(cron_expr: &str) -> ScheduleSpec {
    ScheduleSpec {
        enabled: true,
        cron_expr: cron_expr.to_string(),
        timezone: "UTC".to_string(),
        window_start: None,
        window_end: None,
        max_concurrency: 1,
        timeout_seconds: 3600,
        retry_count: 0,
        retry_backoff_seconds: 60,
    }
}
