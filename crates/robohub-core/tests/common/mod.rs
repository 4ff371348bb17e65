// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for robohub-core integration tests.
//!
//! Provides a TestContext wrapping a temp-file SQLite database, the store
//! and an engine, plus seed helpers for robots, versions, schedules and
//! workers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use robohub_core::engine::{EnginePolicy, RunEngine};
use robohub_core::model::{ArtifactKind, Channel, EntrypointKind};
use robohub_core::persistence::{NewVersion, ScheduleSpec, SqliteStore, Store};

/// Test context owning the database and engine.
pub struct TestContext {
    pub store: Arc<SqliteStore>,
    pub engine: RunEngine,
    _dir: TempDir,
}

impl TestContext {
    /// Create a fresh database, store and engine.
    pub async fn new() -> Self {
        Self::with_policy(EnginePolicy::default()).await
    }

    /// Create a fresh context with a custom engine policy.
    pub async fn with_policy(policy: EnginePolicy) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let store = Arc::new(
            SqliteStore::from_path(dir.path().join("robohub-test.db"))
                .await
                .expect("open test database"),
        );
        let engine = RunEngine::new(store.clone(), policy);
        Self {
            store,
            engine,
            _dir: dir,
        }
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

    /// Register a RUNNING worker with a fresh heartbeat.
    pub async fn seed_worker(&self, worker_id: &str) {
        self.store
            .upsert_worker_heartbeat(worker_id, "test-host", Some("test"), Utc::now())
            .await
            .expect("register worker");
    }

    /// Attach a schedule to a robot; returns the schedule id.
    pub async fn seed_schedule(&self, robot_id: &str, spec: ScheduleSpec) -> String {
        self.store
            .create_schedule(robot_id, &spec)
            .await
            .expect("create schedule")
            .id
    }
}

/// A permissive schedule spec used as a baseline in tests.
pub fn schedule_spec() -> ScheduleSpec {
    ScheduleSpec {
        enabled: true,
        cron_expr: "* * * * *".to_string(),
        timezone: "UTC".to_string(),
        window_start: None,
        window_end: None,
        max_concurrency: 1,
        timeout_seconds: 3600,
        retry_count: 0,
        retry_backoff_seconds: 60,
    }
}
