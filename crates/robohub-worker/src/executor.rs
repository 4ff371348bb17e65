// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run materialization and child process supervision.
//!
//! For each claimed run the executor fetches the artifact bytes by digest,
//! verifies and unpacks them into a scratch workspace, assembles the child
//! environment (version defaults, decrypted env bindings, runtime
//! overrides), spawns the entrypoint, streams stdout/stderr into run logs,
//! polls for cooperative cancellation, enforces the effective timeout, and
//! reports the terminal outcome with any files the robot left in its
//! output directory.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use robohub_core::blobstore::BlobStore;
use robohub_core::cipher::Cipher;
use robohub_core::engine::{ClaimedRun, NewArtifact, RunEngine};
use robohub_core::error::CoreError;
use robohub_core::model::{ArtifactKind, EntrypointKind, LogLevel, RunStatus};
use robohub_core::persistence::Store;

use crate::config::WorkerConfig;

/// Child pids of in-flight runs, shared with the worker's kill loop.
pub type ActivePids = Arc<Mutex<HashMap<String, u32>>>;

/// How a supervised child ended.
enum ExitOutcome {
    /// Child exited on its own with this code (None = killed by signal).
    Exited(Option<i32>),
    /// The effective timeout elapsed.
    TimedOut,
    /// Cancellation was observed and the child terminated.
    Canceled,
}

/// Executes claimed runs.
pub struct Executor {
    engine: Arc<RunEngine>,
    blobstore: BlobStore,
    cipher: Cipher,
    config: WorkerConfig,
    active_pids: ActivePids,
    hostname: String,
}

impl Executor {
    /// Create an executor sharing the worker's pid registry.
    pub fn new(
        engine: Arc<RunEngine>,
        cipher: Cipher,
        config: WorkerConfig,
        active_pids: ActivePids,
    ) -> Self {
        let blobstore = BlobStore::new(&config.data_dir);
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self {
            engine,
            blobstore,
            cipher,
            config,
            active_pids,
            hostname,
        }
    }

    /// Execute one claimed run to a terminal state.
    ///
    /// Every failure path reports into the run; this method never leaves a
    /// claimed run RUNNING behind (short of a worker crash, which the hub
    /// watchdog covers).
    pub async fn execute(&self, claimed: ClaimedRun) {
        let run_id = claimed.run.run_id.clone();
        info!(run_id = %run_id, robot_id = %claimed.run.robot_id, "Executing run");

        if let Err(e) = self.try_execute(&claimed).await {
            // Infrastructure faults (store unavailable) are reported under
            // a stable marker; everything else keeps its concrete cause.
            let message = match &e {
                CoreError::DatabaseError { .. } => "infra-unavailable".to_string(),
                other => other.to_string(),
            };
            warn!(run_id = %run_id, error = %e, "Run failed before completion");
            let _ = self
                .engine
                .append_log(&run_id, LogLevel::Error, &message)
                .await;
            self.report_failed_with_retry(&run_id, &message).await;
        }

        self.active_pids.lock().unwrap().remove(&run_id);
    }

    /// Terminal reports survive brief store hiccups: capped exponential
    /// backoff before giving up (the hub watchdog then reclaims the run).
    async fn report_failed_with_retry(&self, run_id: &str, message: &str) {
        let mut delay = std::time::Duration::from_millis(250);
        for attempt in 0..4 {
            match self
                .engine
                .report_finish(run_id, RunStatus::Failed, Some(message), &[])
                .await
            {
                Ok(_) => return,
                Err(CoreError::DatabaseError { .. }) if attempt < 3 => {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    warn!(run_id = %run_id, error = %e, "Failed to report run failure");
                    return;
                }
            }
        }
    }

    /// The happy path; any error here is turned into a FAILED report by
    /// the caller.
    async fn try_execute(&self, claimed: &ClaimedRun) -> Result<(), CoreError> {
        let run = &claimed.run;
        let version = &claimed.version;

        let run_dir = self.config.data_dir.join("runs").join(&run.run_id);
        let workspace = run_dir.join("workspace");
        let output_dir = run_dir.join("output");
        tokio::fs::create_dir_all(&workspace).await?;
        tokio::fs::create_dir_all(&output_dir).await?;

        // 1. Artifact bytes, digest-verified by the blob store.
        let bytes = self.blobstore.get(&version.artifact_digest).await?;

        // 2. Unpack into the workspace.
        let entrypoint = materialize_artifact(
            &workspace,
            version.artifact_kind,
            &version.entrypoint_path,
            bytes,
        )
        .await?;

        // 3. Environment: defaults <- bindings <- runtime overrides.
        let env = self.assemble_env(claimed).await?;

        // 4. Arguments: defaults then runtime.
        let mut arguments = version.arguments();
        arguments.extend(run.arguments());

        let working_dir = match version.working_dir.as_deref() {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => workspace.join(dir),
            None => workspace.clone(),
        };

        // 5. Spawn.
        let program_is_script = version.artifact_kind == ArtifactKind::Zip
            && version.entrypoint_kind == EntrypointKind::Script;
        let mut command = if program_is_script {
            let mut c = Command::new(&self.config.python_executable);
            c.arg(&entrypoint);
            c
        } else {
            Command::new(&entrypoint)
        };
        command
            .args(&arguments)
            .envs(&env)
            .env("ROBOT_OUTPUT_DIR", &output_dir)
            .current_dir(&working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        self.engine
            .append_log(
                &run.run_id,
                LogLevel::Info,
                &format!("starting version {} on {}", version.version, self.hostname),
            )
            .await?;

        let mut child = command.spawn().map_err(|e| CoreError::IoError {
            details: format!("failed to spawn entrypoint: {}", e),
        })?;
        let pid = child.id();
        if let Some(pid) = pid {
            self.active_pids
                .lock()
                .unwrap()
                .insert(run.run_id.clone(), pid);
        }

        self.engine
            .report_start(&run.run_id, &self.hostname, pid.map(|p| p as i64))
            .await?;

        // 6. Stream stdout as INFO and stderr as ERROR.
        let stdout_task = self.spawn_line_pump(&run.run_id, child.stdout.take(), LogLevel::Info);
        let stderr_task = self.spawn_line_pump(&run.run_id, child.stderr.take(), LogLevel::Error);

        // 7. Supervise: exit, timeout, or cancellation.
        let timeout_seconds = self.engine.effective_timeout_seconds(run).await?;
        let outcome = self
            .supervise(&run.run_id, &mut child, timeout_seconds)
            .await;

        // Let buffered output drain before the terminal report; stragglers
        // are still accepted post-terminal.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        // 8. Terminal report with collected artifacts.
        let artifacts = collect_artifacts(&output_dir).await;
        match outcome {
            ExitOutcome::Exited(Some(0)) => {
                self.engine
                    .report_finish(&run.run_id, RunStatus::Success, None, &artifacts)
                    .await?;
            }
            ExitOutcome::Exited(code) => {
                let message = match code {
                    Some(code) => format!("exit code {}", code),
                    None => "terminated by signal".to_string(),
                };
                self.engine
                    .report_finish(&run.run_id, RunStatus::Failed, Some(&message), &artifacts)
                    .await?;
            }
            ExitOutcome::TimedOut => {
                self.engine
                    .report_finish(&run.run_id, RunStatus::Failed, Some("TIMEOUT"), &artifacts)
                    .await?;
            }
            ExitOutcome::Canceled => {
                // The hub may have force-canceled during the grace window;
                // a lost race here just means the state is already final.
                if let Err(e) = self
                    .engine
                    .report_finish(&run.run_id, RunStatus::Canceled, None, &artifacts)
                    .await
                {
                    debug!(run_id = %run.run_id, error = %e, "Cancel already finalized");
                }
            }
        }

        Ok(())
    }

    /// Overlay version defaults, decrypted bindings for the run's
    /// environment, and the trigger's runtime env. Fails before spawn when
    /// required keys are unbound.
    async fn assemble_env(&self, claimed: &ClaimedRun) -> Result<HashMap<String, String>, CoreError> {
        let run = &claimed.run;
        let version = &claimed.version;

        let mut env = version.env();
        let bindings = self
            .engine
            .store()
            .list_env_bindings(&run.robot_id, run.env_name)
            .await?;
        for binding in bindings {
            env.insert(binding.key.clone(), self.cipher.decrypt(&binding.value)?);
        }
        for (key, value) in run.env() {
            env.insert(key, value);
        }

        let missing: BTreeSet<String> = version
            .required_keys()
            .into_iter()
            .filter(|key| !env.contains_key(key))
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::MissingRequiredEnv {
                keys: missing.into_iter().collect::<Vec<_>>().join(", "),
            });
        }

        Ok(env)
    }

    /// Pump one child stream into run logs, line by line.
    fn spawn_line_pump<R>(
        &self,
        run_id: &str,
        stream: Option<R>,
        level: LogLevel,
    ) -> tokio::task::JoinHandle<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let engine = self.engine.clone();
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            let Some(stream) = stream else {
                return;
            };
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Err(e) = engine.append_log(&run_id, level, &line).await {
                    warn!(run_id = %run_id, error = %e, "Dropping child output line");
                }
            }
        })
    }

    /// Wait for the child while enforcing timeout and cancellation.
    async fn supervise(
        &self,
        run_id: &str,
        child: &mut Child,
        timeout_seconds: i64,
    ) -> ExitOutcome {
        let timeout = tokio::time::sleep(std::time::Duration::from_secs(
            timeout_seconds.max(1) as u64,
        ));
        tokio::pin!(timeout);
        let mut cancel_poll = tokio::time::interval(self.config.cancel_poll_interval);
        cancel_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                status = child.wait() => {
                    return match status {
                        Ok(status) => ExitOutcome::Exited(status.code()),
                        Err(e) => {
                            warn!(run_id = %run_id, error = %e, "wait() failed");
                            ExitOutcome::Exited(None)
                        }
                    };
                }
                _ = &mut timeout => {
                    warn!(run_id = %run_id, timeout_seconds, "Run timed out, terminating child");
                    self.terminate(run_id, child).await;
                    return ExitOutcome::TimedOut;
                }
                _ = cancel_poll.tick() => {
                    if self.cancellation_observed(run_id).await {
                        info!(run_id = %run_id, "Cancellation observed, terminating child");
                        self.terminate(run_id, child).await;
                        return ExitOutcome::Canceled;
                    }
                }
            }
        }
    }

    /// Whether the run's cooperative cancel flag is set. Force-kill
    /// signals are handled by the worker's kill loop via the pid registry.
    async fn cancellation_observed(&self, run_id: &str) -> bool {
        match self.engine.is_cancel_requested(run_id).await {
            Ok(requested) => requested,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Cancel poll failed");
                false
            }
        }
    }

    /// SIGTERM, grace, then SIGKILL.
    async fn terminate(&self, run_id: &str, child: &mut Child) {
        if let Some(pid) = child.id() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => debug!(run_id = %run_id, pid, "Sent SIGTERM"),
                Err(e) => warn!(run_id = %run_id, pid, error = %e, "SIGTERM failed"),
            }
        }

        match tokio::time::timeout(self.config.cancel_grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(run_id = %run_id, "Grace expired, killing child");
                if let Err(e) = child.kill().await {
                    warn!(run_id = %run_id, error = %e, "SIGKILL failed");
                }
            }
        }
    }
}

/// Unpack the artifact into the workspace and return the entrypoint path.
async fn materialize_artifact(
    workspace: &Path,
    kind: ArtifactKind,
    entrypoint_path: &str,
    bytes: Vec<u8>,
) -> Result<PathBuf, CoreError> {
    match kind {
        ArtifactKind::Zip => {
            let workspace = workspace.to_path_buf();
            tokio::task::spawn_blocking(move || -> Result<(), CoreError> {
                let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
                    .map_err(|e| CoreError::IoError {
                        details: format!("invalid zip artifact: {}", e),
                    })?;
                archive.extract(&workspace).map_err(|e| CoreError::IoError {
                    details: format!("failed to extract artifact: {}", e),
                })
            })
            .await
            .map_err(|e| CoreError::IoError {
                details: format!("extract task failed: {}", e),
            })??;
        }
        ArtifactKind::Exe => {
            let target = workspace.join(entrypoint_path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&target, &bytes).await?;
        }
    }

    let entrypoint = workspace.join(entrypoint_path);
    if !tokio::fs::try_exists(&entrypoint).await? {
        return Err(CoreError::IoError {
            details: format!("entrypoint not found in artifact: {}", entrypoint_path),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = tokio::fs::metadata(&entrypoint).await?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o755);
        tokio::fs::set_permissions(&entrypoint, permissions).await?;
    }

    Ok(entrypoint)
}

/// Register every file the robot left in its output directory.
async fn collect_artifacts(output_dir: &Path) -> Vec<NewArtifact> {
    let mut artifacts = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(output_dir).await else {
        return artifacts;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        artifacts.push(NewArtifact {
            name: entry.file_name().to_string_lossy().to_string(),
            path: path.to_string_lossy().to_string(),
            size_bytes: metadata.len() as i64,
            content_type: None,
        });
    }
    artifacts.sort_by(|a, b| a.name.cmp(&b.name));
    artifacts
}
