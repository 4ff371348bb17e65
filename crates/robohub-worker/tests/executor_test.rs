// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executor tests against real child processes: exit codes, output
//! streaming, env assembly, timeout, cancellation and artifacts.

#![cfg(unix)]

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use robohub_core::blobstore::BlobStore;
use robohub_core::cipher::Cipher;
use robohub_core::engine::{EnginePolicy, RunEngine, RunIntent};
use robohub_core::model::{
    ArtifactKind, Channel, EntrypointKind, EnvName, LogLevel, RunStatus,
};
use robohub_core::persistence::{NewVersion, SqliteStore, Store};
use robohub_worker::WorkerConfig;
use robohub_worker::executor::Executor;

struct ExecHarness {
    store: Arc<SqliteStore>,
    engine: Arc<RunEngine>,
    executor: Executor,
    blobstore: BlobStore,
    cipher: Cipher,
    _dir: TempDir,
}

impl ExecHarness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::from_path(dir.path().join("hub.db"))
                .await
                .unwrap(),
        );
        let engine = Arc::new(RunEngine::new(
            store.clone(),
            EnginePolicy {
                default_manual_timeout_seconds: 30,
                ..EnginePolicy::default()
            },
        ));
        let cipher = Cipher::new("executor-test-key").unwrap();
        let config = WorkerConfig {
            database_url: "unused".to_string(),
            data_dir: dir.path().to_path_buf(),
            worker_id_file: dir.path().join("worker.id"),
            heartbeat_interval: Duration::from_secs(15),
            claim_interval: Duration::from_millis(100),
            cancel_poll_interval: Duration::from_millis(200),
            cancel_grace: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(10),
            max_parallel_runs: 2,
            python_executable: "python3".to_string(),
        };
        let executor = Executor::new(
            engine.clone(),
            cipher.clone(),
            config,
            Arc::new(Mutex::new(HashMap::new())),
        );
        let blobstore = BlobStore::new(dir.path());
        Self {
            store,
            engine,
            executor,
            blobstore,
            cipher,
            _dir: dir,
        }
    }

    /// Publish a shell script as an exe-kind version of a fresh robot.
    async fn seed_script_robot(&self, name: &str, script: &str) -> String {
        let digest = self.blobstore.put(script.as_bytes()).await.unwrap();
        self.seed_robot_with(name, ArtifactKind::Exe, EntrypointKind::Binary, "run.sh", &digest, &[])
            .await
    }

    async fn seed_robot_with(
        &self,
        name: &str,
        artifact_kind: ArtifactKind,
        entrypoint_kind: EntrypointKind,
        entrypoint_path: &str,
        digest: &str,
        required_env_keys: &[&str],
    ) -> String {
        let robot = self.store.create_robot(name, None, &[]).await.unwrap();
        self.store
            .insert_version(&NewVersion {
                id: Uuid::new_v4().to_string(),
                robot_id: robot.id.clone(),
                version: "1.0.0".to_string(),
                channel: Channel::Stable,
                artifact_kind,
                artifact_digest: digest.to_string(),
                entrypoint_kind,
                entrypoint_path: entrypoint_path.to_string(),
                default_arguments: Vec::new(),
                default_env: HashMap::new(),
                working_dir: None,
                required_env_keys: required_env_keys.iter().map(|k| k.to_string()).collect(),
                changelog: None,
                commit_sha: None,
                branch: None,
                build_url: None,
                created_source: "user".to_string(),
                is_active: true,
            })
            .await
            .unwrap();
        robot.id
    }

    /// Create, claim and execute a run for the robot; returns the run id.
    async fn run_to_completion(&self, robot_id: &str) -> String {
        let run_id = self.start_run(robot_id).await;
        let claimed = self.engine.claim_next("w1").await.unwrap().unwrap();
        self.executor.execute(claimed).await;
        run_id
    }

    async fn start_run(&self, robot_id: &str) -> String {
        self.store
            .upsert_worker_heartbeat("w1", "test-host", None, chrono::Utc::now())
            .await
            .unwrap();
        self.engine
            .create_run(RunIntent::manual(robot_id, EnvName::Test))
            .await
            .unwrap()
            .run_id
    }

    async fn messages(&self, run_id: &str, level: LogLevel) -> Vec<String> {
        self.engine
            .get_logs_since(run_id, -1, 1000)
            .await
            .unwrap()
            .into_iter()
            .filter(|l| l.level == level)
            .map(|l| l.message)
            .collect()
    }
}

#[tokio::test]
async fn test_successful_run_streams_stdout() {
    let h = ExecHarness::new().await;
    let robot_id = h.seed_script_robot("echoer", "#!/bin/sh\necho ok\n").await;

    let run_id = h.run_to_completion(&robot_id).await;

    let run = h.engine.require_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert!(run.error_message.is_none());
    assert!(run.duration_seconds.unwrap() >= 0.0);
    assert!(run.process_id.is_some());
    assert!(run.host_name.is_some());

    let stdout = h.messages(&run_id, LogLevel::Info).await;
    assert!(stdout.iter().any(|m| m == "ok"), "stdout forwarded: {:?}", stdout);
}

#[tokio::test]
async fn test_nonzero_exit_fails_with_code() {
    let h = ExecHarness::new().await;
    let robot_id = h
        .seed_script_robot("exits", "#!/bin/sh\necho oops >&2\nexit 2\n")
        .await;

    let run_id = h.run_to_completion(&robot_id).await;

    let run = h.engine.require_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("exit code 2"));

    let stderr = h.messages(&run_id, LogLevel::Error).await;
    assert!(stderr.iter().any(|m| m == "oops"), "stderr forwarded: {:?}", stderr);
}

#[tokio::test]
async fn test_timeout_terminates_and_reports() {
    let h = ExecHarness::new().await;
    let robot_id = h.seed_script_robot("sleeper", "#!/bin/sh\nsleep 30\n").await;
    h.store
        .create_schedule(
            &robot_id,
            &robohub_core::persistence::ScheduleSpec {
                enabled: true,
                cron_expr: "* * * * *".to_string(),
                timezone: "UTC".to_string(),
                window_start: None,
                window_end: None,
                max_concurrency: 1,
                timeout_seconds: 1,
                retry_count: 0,
                retry_backoff_seconds: 60,
            },
        )
        .await
        .unwrap();

    // The 1s schedule timeout only applies to runs linked to the
    // schedule, so trigger this one as SCHEDULED.
    h.store
        .upsert_worker_heartbeat("w1", "test-host", None, chrono::Utc::now())
        .await
        .unwrap();
    let schedule = h.store.get_schedule(&robot_id).await.unwrap().unwrap();
    let run = h
        .engine
        .create_run(RunIntent {
            trigger_type: robohub_core::model::TriggerType::Scheduled,
            schedule_id: Some(schedule.id),
            fire_time: Some(chrono::Utc::now()),
            ..RunIntent::manual(&robot_id, EnvName::Test)
        })
        .await
        .unwrap();

    let claimed = h.engine.claim_next("w1").await.unwrap().unwrap();
    let started = std::time::Instant::now();
    h.executor.execute(claimed).await;
    assert!(started.elapsed() < Duration::from_secs(10), "terminated promptly");

    let run = h.engine.require_run(&run.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some("TIMEOUT"));
}

#[tokio::test]
async fn test_cooperative_cancel_terminates_child() {
    let h = ExecHarness::new().await;
    let robot_id = h
        .seed_script_robot("cancelable", "#!/bin/sh\necho running\nsleep 30\n")
        .await;

    let run_id = h.start_run(&robot_id).await;
    let claimed = h.engine.claim_next("w1").await.unwrap().unwrap();

    let engine = h.engine.clone();
    let cancel_run_id = run_id.clone();
    let canceler = tokio::spawn(async move {
        // Give the child a moment to start, then request cancellation.
        tokio::time::sleep(Duration::from_millis(600)).await;
        engine
            .request_cancel(&cancel_run_id, Some("ops"))
            .await
            .unwrap();
    });

    let started = std::time::Instant::now();
    h.executor.execute(claimed).await;
    canceler.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10), "canceled promptly");

    let run = h.engine.require_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Canceled);
    assert!(run.cancel_requested);
    assert_eq!(run.canceled_by.as_deref(), Some("ops"));
}

#[tokio::test]
async fn test_missing_required_env_fails_before_spawn() {
    let h = ExecHarness::new().await;
    let digest = h
        .blobstore
        .put(b"#!/bin/sh\necho should-not-run\n")
        .await
        .unwrap();
    let robot_id = h
        .seed_robot_with(
            "needs-env",
            ArtifactKind::Exe,
            EntrypointKind::Binary,
            "run.sh",
            &digest,
            &["API_KEY", "API_URL"],
        )
        .await;

    // Bind one of the two required keys; the other stays missing.
    let ciphertext = h.cipher.encrypt("https://api.internal");
    h.store
        .upsert_env_binding(&robot_id, EnvName::Test, "API_URL", &ciphertext, false)
        .await
        .unwrap();

    let run_id = h.run_to_completion(&robot_id).await;

    let run = h.engine.require_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.error_message.as_deref(),
        Some("MissingRequiredEnv: API_KEY")
    );
    let stdout = h.messages(&run_id, LogLevel::Info).await;
    assert!(!stdout.iter().any(|m| m == "should-not-run"));
}

#[tokio::test]
async fn test_env_bindings_are_decrypted_into_child_env() {
    let h = ExecHarness::new().await;
    let robot_id = h
        .seed_script_robot("env-reader", "#!/bin/sh\necho \"token=$SERVICE_TOKEN\"\n")
        .await;

    let ciphertext = h.cipher.encrypt("s3cr3t-value");
    h.store
        .upsert_env_binding(&robot_id, EnvName::Test, "SERVICE_TOKEN", &ciphertext, true)
        .await
        .unwrap();

    let run_id = h.run_to_completion(&robot_id).await;

    let run = h.engine.require_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let stdout = h.messages(&run_id, LogLevel::Info).await;
    assert!(stdout.iter().any(|m| m == "token=s3cr3t-value"));
}

#[tokio::test]
async fn test_zip_artifact_is_extracted_and_run() {
    let h = ExecHarness::new().await;

    let mut buf = Vec::new();
    {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        writer.start_file("bin/main.sh", options).unwrap();
        writer
            .write_all(b"#!/bin/sh\ncat data/greeting.txt\n")
            .unwrap();
        writer
            .start_file("data/greeting.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"hello from zip").unwrap();
        writer.finish().unwrap();
    }
    let digest = h.blobstore.put(&buf).await.unwrap();

    let robot_id = h
        .seed_robot_with(
            "zipped",
            ArtifactKind::Zip,
            EntrypointKind::Binary,
            "bin/main.sh",
            &digest,
            &[],
        )
        .await;

    let run_id = h.run_to_completion(&robot_id).await;

    let run = h.engine.require_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    let stdout = h.messages(&run_id, LogLevel::Info).await;
    assert!(stdout.iter().any(|m| m == "hello from zip"));
}

#[tokio::test]
async fn test_output_files_become_artifacts() {
    let h = ExecHarness::new().await;
    let robot_id = h
        .seed_script_robot(
            "producer",
            "#!/bin/sh\nprintf 'a,b\\n1,2\\n' > \"$ROBOT_OUTPUT_DIR/report.csv\"\n",
        )
        .await;

    let run_id = h.run_to_completion(&robot_id).await;

    let run = h.engine.require_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);

    let artifacts = h.store.list_artifacts(&run_id).await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].name, "report.csv");
    assert!(artifacts[0].size_bytes > 0);
    assert!(std::path::Path::new(&artifacts[0].path).exists());
}

#[tokio::test]
async fn test_missing_artifact_bytes_fail_dispatch() {
    let h = ExecHarness::new().await;
    let robot_id = h
        .seed_robot_with(
            "no-blob",
            ArtifactKind::Exe,
            EntrypointKind::Binary,
            "run.sh",
            &"e".repeat(64),
            &[],
        )
        .await;

    let run_id = h.run_to_completion(&robot_id).await;

    let run = h.engine.require_run(&run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(
        run.error_message.unwrap().contains("Artifact bytes missing"),
        "artifact fetch failure is reported"
    );
}
