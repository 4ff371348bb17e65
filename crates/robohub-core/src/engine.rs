// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The authoritative run state machine.
//!
//! Every run transition in the system funnels through [`RunEngine`]:
//! intake (`create_run`), dispatch (`claim_next`), execution reporting
//! (`report_start`, `append_log`, `report_finish`), cooperative
//! cancellation (`request_cancel`) and the watchdog backup paths. State
//! edges are enforced with conditional updates in the store, so a lost
//! race surfaces as "no row changed" rather than a corrupt transition.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::logbus::LogBus;
use crate::model::{EnvName, LogLevel, RunStatus, TriggerType, WorkerStatus};
use crate::persistence::{
    NewRun, RobotVersionRecord, RunLogRecord, RunRecord, ScheduleRecord, Store,
};
use crate::queue::RunQueue;

/// Upper bound on queue entries inspected per `claim_next` call.
const MAX_CLAIM_PASSES: usize = 16;

/// FAILED runs keep at most this much error detail.
const ERROR_MESSAGE_LIMIT: usize = 1024;

/// Tunables the engine shares with the watchdog loops.
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// Seconds without a heartbeat before a worker may not claim.
    pub worker_stale_seconds: i64,
    /// Effective timeout for runs without a schedule.
    pub default_manual_timeout_seconds: i64,
    /// Grace between a cancel request and the forced CANCELED.
    pub cancel_grace_seconds: i64,
    /// Margin the backup watchdog grants over the worker-side timeout.
    pub watchdog_margin_seconds: i64,
    /// Fallback timezone for schedule window checks.
    pub app_timezone: String,
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self {
            worker_stale_seconds: 180,
            default_manual_timeout_seconds: 3600,
            cancel_grace_seconds: 30,
            watchdog_margin_seconds: 15,
            app_timezone: "UTC".to_string(),
        }
    }
}

impl From<&CoreConfig> for EnginePolicy {
    fn from(config: &CoreConfig) -> Self {
        Self {
            worker_stale_seconds: config.worker_stale_seconds,
            default_manual_timeout_seconds: config.default_manual_timeout_seconds,
            cancel_grace_seconds: config.cancel_grace_seconds,
            watchdog_margin_seconds: config.watchdog_margin_seconds,
            app_timezone: config.app_timezone.clone(),
        }
    }
}

/// A run intent handed to [`RunEngine::create_run`].
#[derive(Debug, Clone)]
pub struct RunIntent {
    /// Target robot.
    pub robot_id: String,
    /// Explicit version id; None resolves the robot's active version.
    pub version_id: Option<String>,
    /// Environment to execute against.
    pub env_name: EnvName,
    /// Runtime arguments appended after the version defaults.
    pub runtime_arguments: Vec<String>,
    /// Runtime env overlaid last during materialization.
    pub runtime_env: std::collections::HashMap<String, String>,
    /// Origin of the run.
    pub trigger_type: TriggerType,
    /// User that triggered the run.
    pub triggered_by: Option<String>,
    /// Attempt number; 1 unless the engine creates a retry.
    pub attempt: i64,
    /// Originating schedule (required for SCHEDULED).
    pub schedule_id: Option<String>,
    /// Originating self-service entry.
    pub service_id: Option<String>,
    /// Cron fire time (idempotency key half for SCHEDULED runs).
    pub fire_time: Option<DateTime<Utc>>,
    /// Delay before the run becomes claimable (retry backoff).
    pub not_before: Option<DateTime<Utc>>,
}

impl RunIntent {
    /// A manual run with default attempt and no schedule linkage.
    pub fn manual(robot_id: impl Into<String>, env_name: EnvName) -> Self {
        Self {
            robot_id: robot_id.into(),
            version_id: None,
            env_name,
            runtime_arguments: Vec::new(),
            runtime_env: Default::default(),
            trigger_type: TriggerType::Manual,
            triggered_by: None,
            attempt: 1,
            schedule_id: None,
            service_id: None,
            fire_time: None,
            not_before: None,
        }
    }
}

/// A run handed to a worker by `claim_next`.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    /// The run, already RUNNING.
    pub run: RunRecord,
    /// The exact version to materialize.
    pub version: RobotVersionRecord,
    /// The robot's schedule, when it has one.
    pub schedule: Option<ScheduleRecord>,
}

/// An output artifact reported at finish.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    /// File name, unique per run.
    pub name: String,
    /// Path on the shared data dir.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: i64,
    /// Optional MIME type.
    pub content_type: Option<String>,
}

/// The run lifecycle engine.
pub struct RunEngine {
    store: Arc<dyn Store>,
    queue: RunQueue,
    logbus: Arc<LogBus>,
    policy: EnginePolicy,
}

impl RunEngine {
    /// Create an engine over the given store.
    pub fn new(store: Arc<dyn Store>, policy: EnginePolicy) -> Self {
        let queue = RunQueue::new(store.clone());
        let logbus = Arc::new(LogBus::new(store.clone()));
        Self {
            store,
            queue,
            logbus,
            policy,
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The run queue.
    pub fn queue(&self) -> &RunQueue {
        &self.queue
    }

    /// The log bus for live subscriptions.
    pub fn logbus(&self) -> &Arc<LogBus> {
        &self.logbus
    }

    /// The engine policy.
    pub fn policy(&self) -> &EnginePolicy {
        &self.policy
    }

    // ------------------------------------------------------------------
    // Intake
    // ------------------------------------------------------------------

    /// Accept a run intent: resolve the version, persist the PENDING run
    /// and enqueue it.
    #[instrument(skip(self, intent), fields(robot_id = %intent.robot_id, trigger = %intent.trigger_type))]
    pub async fn create_run(&self, intent: RunIntent) -> Result<RunRecord, CoreError> {
        let robot = self
            .store
            .get_robot(&intent.robot_id)
            .await?
            .ok_or_else(|| CoreError::RobotNotFound {
                robot_id: intent.robot_id.clone(),
            })?;

        let version = self.resolve_version(&robot.id, intent.version_id.as_deref()).await?;

        match intent.trigger_type {
            TriggerType::Scheduled if intent.schedule_id.is_none() => {
                return Err(CoreError::ValidationError {
                    field: "schedule_id".to_string(),
                    message: "SCHEDULED runs must reference their schedule".to_string(),
                });
            }
            TriggerType::Retry if intent.attempt < 2 => {
                return Err(CoreError::ValidationError {
                    field: "attempt".to_string(),
                    message: "RETRY runs start at attempt 2".to_string(),
                });
            }
            _ => {}
        }
        if intent.attempt < 1 {
            return Err(CoreError::ValidationError {
                field: "attempt".to_string(),
                message: "attempt must be >= 1".to_string(),
            });
        }

        let now = clock::now_utc();
        let new_run = NewRun {
            run_id: Uuid::new_v4().to_string(),
            robot_id: robot.id.clone(),
            robot_version_id: version.id.clone(),
            service_id: intent.service_id,
            schedule_id: intent.schedule_id,
            fire_time: intent.fire_time,
            env_name: intent.env_name,
            trigger_type: intent.trigger_type,
            attempt: intent.attempt,
            runtime_arguments: intent.runtime_arguments,
            runtime_env: intent.runtime_env,
            queued_at: now,
            triggered_by: intent.triggered_by,
        };
        let run = self.store.insert_run(&new_run).await?;

        self.append_lifecycle_log(&run.run_id, LogLevel::Info, "enqueued", false)
            .await;

        // Enqueue after the insert committed; the claim gate makes any
        // duplicate delivery harmless.
        self.queue
            .push(&run.run_id, run.queued_at, intent.not_before)
            .await?;

        info!(
            run_id = %run.run_id,
            version = %version.version,
            attempt = run.attempt,
            "Run accepted"
        );
        Ok(run)
    }

    async fn resolve_version(
        &self,
        robot_id: &str,
        version_id: Option<&str>,
    ) -> Result<RobotVersionRecord, CoreError> {
        match version_id {
            Some(id) => self
                .store
                .get_version_of_robot(robot_id, id)
                .await?
                .ok_or_else(|| CoreError::VersionNotFound {
                    version_ref: id.to_string(),
                }),
            None => self
                .store
                .get_active_version(robot_id)
                .await?
                .ok_or_else(|| CoreError::NoActiveVersion {
                    robot_id: robot_id.to_string(),
                }),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Pop the next runnable run for a worker, or None when the queue has
    /// nothing eligible.
    ///
    /// Eligibility is enforced here, making dispatch at-most-once even
    /// though enqueue is at-least-once: the PENDING→RUNNING conditional
    /// update is the single atomic gate.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<ClaimedRun>, CoreError> {
        let now = clock::now_utc();

        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| CoreError::WorkerNotFound {
                worker_id: worker_id.to_string(),
            })?;
        if worker.status != WorkerStatus::Running {
            debug!(status = %worker.status, "Worker not claiming");
            return Ok(None);
        }
        if now - worker.last_heartbeat > Duration::seconds(self.policy.worker_stale_seconds) {
            warn!("Stale worker attempted to claim");
            return Ok(None);
        }

        for _ in 0..MAX_CLAIM_PASSES {
            let Some(entry) = self.queue.pop(now).await? else {
                return Ok(None);
            };

            let Some(run) = self.store.get_run(&entry.run_id).await? else {
                debug!(run_id = %entry.run_id, "Dropping queue entry for unknown run");
                continue;
            };
            if run.status != RunStatus::Pending {
                // Stale delivery; the entry is already consumed.
                continue;
            }

            let schedule = self.store.get_schedule(&run.robot_id).await?;
            let max_concurrency = schedule.as_ref().map(|s| s.max_concurrency).unwrap_or(1);
            let backoff = schedule
                .as_ref()
                .map(|s| s.retry_backoff_seconds)
                .unwrap_or(30);

            let running = self.store.count_running_for_robot(&run.robot_id).await?;
            if running >= max_concurrency {
                self.queue.defer(&entry, backoff, now).await?;
                continue;
            }

            // The schedule window binds scheduler-created runs (and their
            // retries); manual runs bypass it.
            if run.trigger_type != TriggerType::Manual && run.schedule_id.is_some() {
                if let Some(s) = schedule.as_ref() {
                    let tz = clock::resolve_timezone(&s.timezone, &self.policy.app_timezone);
                    if !clock::within_window(now, tz, s.window_start.as_deref(), s.window_end.as_deref())? {
                        self.queue.defer(&entry, backoff, now).await?;
                        continue;
                    }
                }
            }

            if !self
                .store
                .mark_run_running(&run.run_id, worker_id, max_concurrency)
                .await?
            {
                // Lost the gate: either the run left PENDING (cancel, a
                // concurrent claim) or the cap filled up underneath us.
                // Still-PENDING runs go back to the queue.
                match self.store.get_run(&run.run_id).await? {
                    Some(r) if r.status == RunStatus::Pending => {
                        self.queue.defer(&entry, backoff, now).await?;
                    }
                    _ => {}
                }
                continue;
            }

            self.append_lifecycle_log(
                &run.run_id,
                LogLevel::Info,
                &format!("claimed by worker {}", worker_id),
                false,
            )
            .await;

            let version = self
                .store
                .get_version(&run.robot_version_id)
                .await?
                .ok_or_else(|| CoreError::VersionNotFound {
                    version_ref: run.robot_version_id.clone(),
                })?;
            let run = self
                .store
                .get_run(&run.run_id)
                .await?
                .ok_or_else(|| CoreError::RunNotFound {
                    run_id: entry.run_id.clone(),
                })?;

            info!(run_id = %run.run_id, robot_id = %run.robot_id, "Run claimed");
            return Ok(Some(ClaimedRun {
                run,
                version,
                schedule,
            }));
        }

        Ok(None)
    }

    // ------------------------------------------------------------------
    // Execution reporting
    // ------------------------------------------------------------------

    /// Record the spawned child's host and pid. Idempotent.
    pub async fn report_start(
        &self,
        run_id: &str,
        host_name: &str,
        process_id: Option<i64>,
    ) -> Result<(), CoreError> {
        let run = self.require_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(CoreError::InvalidRunState {
                run_id: run_id.to_string(),
                expected: RunStatus::Running.as_str().to_string(),
                actual: run.status.as_str().to_string(),
            });
        }
        self.store
            .set_run_started(run_id, host_name, process_id, clock::now_utc())
            .await?;
        Ok(())
    }

    /// Append a run log line and fan it out to subscribers.
    ///
    /// Lines arriving after a terminal transition are accepted for
    /// forensics and tagged, but never re-open the state machine.
    pub async fn append_log(
        &self,
        run_id: &str,
        level: LogLevel,
        message: &str,
    ) -> Result<RunLogRecord, CoreError> {
        let run = self.require_run(run_id).await?;
        let record = self
            .store
            .append_run_log(
                run_id,
                level,
                message,
                run.status.is_terminal(),
                clock::now_utc(),
            )
            .await?;
        self.logbus.publish(&record).await;
        Ok(record)
    }

    /// Report a terminal outcome for a RUNNING run.
    ///
    /// Records artifacts, emits the closing log line, and evaluates the
    /// retry policy for FAILED scheduled runs.
    #[instrument(skip(self, artifacts), fields(run_id = %run_id, outcome = %outcome))]
    pub async fn report_finish(
        &self,
        run_id: &str,
        outcome: RunStatus,
        error_message: Option<&str>,
        artifacts: &[NewArtifact],
    ) -> Result<RunRecord, CoreError> {
        if !outcome.is_terminal() {
            return Err(CoreError::ValidationError {
                field: "outcome".to_string(),
                message: format!("'{}' is not a terminal status", outcome),
            });
        }

        let run = self.require_run(run_id).await?;
        let now = clock::now_utc();
        let started = run.started_at.unwrap_or(run.queued_at);
        let duration = (now - started).num_milliseconds() as f64 / 1000.0;
        let error_message = error_message.map(truncate_error);

        let finished = self
            .store
            .finish_run(
                run_id,
                outcome,
                now,
                Some(duration.max(0.0)),
                error_message.as_deref(),
            )
            .await?;
        if !finished {
            return Err(CoreError::InvalidRunState {
                run_id: run_id.to_string(),
                expected: RunStatus::Running.as_str().to_string(),
                actual: run.status.as_str().to_string(),
            });
        }

        for artifact in artifacts {
            self.store
                .insert_artifact(
                    run_id,
                    &artifact.name,
                    &artifact.path,
                    artifact.size_bytes,
                    artifact.content_type.as_deref(),
                )
                .await?;
        }

        let (level, line) = match outcome {
            RunStatus::Success => (LogLevel::Info, "finished successfully".to_string()),
            RunStatus::Canceled => (LogLevel::Warn, "canceled".to_string()),
            _ => (
                LogLevel::Error,
                error_message.clone().unwrap_or_else(|| "failed".to_string()),
            ),
        };
        self.append_lifecycle_log(run_id, level, &line, true).await;

        if outcome == RunStatus::Failed {
            self.maybe_schedule_retry(&run).await;
        }

        info!(duration_seconds = duration, "Run finished");
        self.require_run(run_id).await
    }

    /// Create the RETRY follow-up when the failed run's schedule still has
    /// retry budget. MANUAL runs never auto-retry.
    async fn maybe_schedule_retry(&self, failed: &RunRecord) {
        if failed.trigger_type == TriggerType::Manual {
            return;
        }
        let Some(schedule_id) = failed.schedule_id.clone() else {
            return;
        };
        let schedule = match self.store.get_schedule(&failed.robot_id).await {
            Ok(Some(s)) if s.id == schedule_id => s,
            Ok(_) => return,
            Err(e) => {
                warn!(run_id = %failed.run_id, error = %e, "Retry evaluation failed");
                return;
            }
        };
        if schedule.retry_count < 1 || failed.attempt > schedule.retry_count {
            return;
        }

        let now = clock::now_utc();
        let intent = RunIntent {
            robot_id: failed.robot_id.clone(),
            version_id: Some(failed.robot_version_id.clone()),
            env_name: failed.env_name,
            runtime_arguments: failed.arguments(),
            runtime_env: failed.env(),
            trigger_type: TriggerType::Retry,
            triggered_by: failed.triggered_by.clone(),
            attempt: failed.attempt + 1,
            schedule_id: Some(schedule_id),
            service_id: failed.service_id.clone(),
            fire_time: None,
            not_before: Some(now + Duration::seconds(schedule.retry_backoff_seconds.max(1))),
        };

        match self.create_run(intent).await {
            Ok(retry) => {
                info!(
                    run_id = %failed.run_id,
                    retry_run_id = %retry.run_id,
                    attempt = retry.attempt,
                    backoff_seconds = schedule.retry_backoff_seconds,
                    "Retry scheduled"
                );
                self.append_lifecycle_log(
                    &failed.run_id,
                    LogLevel::Info,
                    &format!("retry attempt {} scheduled", retry.attempt),
                    true,
                )
                .await;
            }
            Err(e) => {
                warn!(run_id = %failed.run_id, error = %e, "Failed to schedule retry");
            }
        }
    }

    // ------------------------------------------------------------------
    // Cancellation
    // ------------------------------------------------------------------

    /// Request cancellation. PENDING runs cancel immediately; RUNNING runs
    /// get the cooperative flag. Idempotent, including on terminal runs.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn request_cancel(
        &self,
        run_id: &str,
        canceled_by: Option<&str>,
    ) -> Result<RunRecord, CoreError> {
        let run = self.require_run(run_id).await?;
        let now = clock::now_utc();
        let user = canceled_by.unwrap_or("system");

        match run.status {
            RunStatus::Pending => {
                if self.store.cancel_pending_run(run_id, canceled_by, now).await? {
                    self.queue.remove(run_id).await?;
                    self.append_lifecycle_log(
                        run_id,
                        LogLevel::Warn,
                        &format!("canceled while pending by {}", user),
                        true,
                    )
                    .await;
                    info!("Pending run canceled");
                }
            }
            RunStatus::Running => {
                if self
                    .store
                    .request_cancel_running(run_id, canceled_by, now)
                    .await?
                {
                    self.append_lifecycle_log(
                        run_id,
                        LogLevel::Warn,
                        &format!("cancel requested by {}", user),
                        false,
                    )
                    .await;
                    info!("Cancel requested");
                }
            }
            // Terminal: re-cancel is a no-op.
            _ => {}
        }

        self.require_run(run_id).await
    }

    /// Whether cooperative cancellation has been requested for a run.
    pub async fn is_cancel_requested(&self, run_id: &str) -> Result<bool, CoreError> {
        Ok(self.require_run(run_id).await?.cancel_requested)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Ordered log lines with `seq > after_seq`.
    pub async fn get_logs_since(
        &self,
        run_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<RunLogRecord>, CoreError> {
        self.require_run(run_id).await?;
        self.store.list_run_logs_since(run_id, after_seq, limit).await
    }

    /// Fetch a run or fail with RunNotFound.
    pub async fn require_run(&self, run_id: &str) -> Result<RunRecord, CoreError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    // ------------------------------------------------------------------
    // Dispatch-fatal & watchdog paths
    // ------------------------------------------------------------------

    /// Fail a run on a dispatch-fatal condition (missing artifact,
    /// unresolvable env). Valid from PENDING and RUNNING.
    pub async fn fail_dispatch(&self, run_id: &str, message: &str) -> Result<(), CoreError> {
        let run = self.require_run(run_id).await?;
        let message = truncate_error(message);
        match run.status {
            RunStatus::Pending => {
                if self
                    .store
                    .fail_pending_run(run_id, &message, clock::now_utc())
                    .await?
                {
                    self.queue.remove(run_id).await?;
                    self.append_lifecycle_log(run_id, LogLevel::Error, &message, true)
                        .await;
                }
                Ok(())
            }
            RunStatus::Running => {
                self.report_finish(run_id, RunStatus::Failed, Some(&message), &[])
                    .await?;
                Ok(())
            }
            actual => Err(CoreError::InvalidRunState {
                run_id: run_id.to_string(),
                expected: "PENDING or RUNNING".to_string(),
                actual: actual.as_str().to_string(),
            }),
        }
    }

    /// Backup timeout enforcement: fail RUNNING runs whose effective
    /// timeout plus the watchdog margin has elapsed.
    pub async fn expire_timed_out_runs(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut expired = 0;
        for run in self.store.list_running_runs().await? {
            let timeout = self.effective_timeout_seconds(&run).await?;
            let started = run.started_at.unwrap_or(run.queued_at);
            let deadline =
                started + Duration::seconds(timeout + self.policy.watchdog_margin_seconds);
            if now <= deadline {
                continue;
            }
            let duration = (now - started).num_milliseconds() as f64 / 1000.0;
            if self
                .store
                .finish_run(&run.run_id, RunStatus::Failed, now, Some(duration), Some("TIMEOUT"))
                .await?
            {
                warn!(run_id = %run.run_id, timeout_seconds = timeout, "Watchdog timed out run");
                self.append_lifecycle_log(&run.run_id, LogLevel::Error, "TIMEOUT", true)
                    .await;
                self.maybe_schedule_retry(&run).await;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Force-cancel RUNNING runs whose cancel grace has expired, and send
    /// a best-effort kill signal to the owning worker.
    pub async fn expire_cancel_grace(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let grace = Duration::seconds(self.policy.cancel_grace_seconds);
        let mut expired = 0;
        for run in self.store.list_running_runs().await? {
            if !run.cancel_requested {
                continue;
            }
            let requested_at = run.cancel_requested_at.unwrap_or(run.queued_at);
            if now - requested_at <= grace {
                continue;
            }
            if self.store.force_cancel_run(&run.run_id, now).await? {
                warn!(run_id = %run.run_id, "Cancel grace expired, run forcibly canceled");
                self.append_lifecycle_log(
                    &run.run_id,
                    LogLevel::Warn,
                    "cancel grace expired, forcibly canceled",
                    true,
                )
                .await;
                if let Some(worker_id) = run.claimed_by.as_deref() {
                    self.queue.signal_kill(worker_id, &run.run_id).await?;
                }
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Fail RUNNING runs owned by workers that have been stale for twice
    /// the stale threshold. The only non-cooperative exit besides TIMEOUT.
    pub async fn fail_runs_of_lost_workers(&self, now: DateTime<Utc>) -> Result<u64, CoreError> {
        let dead_after = Duration::seconds(self.policy.worker_stale_seconds * 2);
        let lost: std::collections::HashSet<String> = self
            .store
            .list_workers()
            .await?
            .into_iter()
            .filter(|w| w.status != WorkerStatus::Stopped && now - w.last_heartbeat > dead_after)
            .map(|w| w.worker_id)
            .collect();
        if lost.is_empty() {
            return Ok(0);
        }

        let mut failed = 0;
        for run in self.store.list_running_runs().await? {
            let Some(worker_id) = run.claimed_by.as_deref() else {
                continue;
            };
            if !lost.contains(worker_id) {
                continue;
            }
            let started = run.started_at.unwrap_or(run.queued_at);
            let duration = (now - started).num_milliseconds() as f64 / 1000.0;
            if self
                .store
                .finish_run(&run.run_id, RunStatus::Failed, now, Some(duration), Some("worker lost"))
                .await?
            {
                warn!(run_id = %run.run_id, worker_id = %worker_id, "Run failed, worker lost");
                self.append_lifecycle_log(&run.run_id, LogLevel::Error, "worker lost", true)
                    .await;
                self.maybe_schedule_retry(&run).await;
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// The run's effective timeout: its schedule's timeout when it has
    /// one, the manual default otherwise.
    pub async fn effective_timeout_seconds(&self, run: &RunRecord) -> Result<i64, CoreError> {
        if run.schedule_id.is_some() {
            if let Some(schedule) = self.store.get_schedule(&run.robot_id).await? {
                return Ok(schedule.timeout_seconds);
            }
        }
        Ok(self.policy.default_manual_timeout_seconds)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Engine-side lifecycle log lines must never fail the transition
    /// they annotate.
    async fn append_lifecycle_log(
        &self,
        run_id: &str,
        level: LogLevel,
        message: &str,
        post_terminal: bool,
    ) {
        match self
            .store
            .append_run_log(run_id, level, message, post_terminal, clock::now_utc())
            .await
        {
            Ok(record) => self.logbus.publish(&record).await,
            Err(e) => warn!(run_id = %run_id, error = %e, "Failed to append lifecycle log"),
        }
    }
}

fn truncate_error(message: &str) -> String {
    if message.len() <= ERROR_MESSAGE_LIMIT {
        return message.to_string();
    }
    let mut cut = ERROR_MESSAGE_LIMIT;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    message[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        let short = truncate_error("exit code 2");
        assert_eq!(short, "exit code 2");

        let long = "é".repeat(1000);
        let cut = truncate_error(&long);
        assert!(cut.len() <= ERROR_MESSAGE_LIMIT);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_default_policy() {
        let policy = EnginePolicy::default();
        assert_eq!(policy.worker_stale_seconds, 180);
        assert_eq!(policy.cancel_grace_seconds, 30);
        assert_eq!(policy.watchdog_margin_seconds, 15);
    }
}
