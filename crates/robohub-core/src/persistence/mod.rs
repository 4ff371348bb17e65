// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for robohub-core.
//!
//! This module defines the storage abstraction and its record types. The
//! store is a pure repository: it offers CRUD plus guarded conditional
//! updates (returning whether a row was changed) and leaves every business
//! rule to the [`crate::engine`] and the background loops.

pub mod sqlite;

pub use self::sqlite::SqliteStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::model::{
    AlertSeverity, AlertType, ArtifactKind, Channel, EntrypointKind, EnvName, LogLevel, RunStatus,
    TriggerType, WorkerStatus,
};

/// Robot record from the persistence layer.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct RobotRecord {
    /// Unique identifier.
    pub id: String,
    /// Globally unique robot name.
    pub name: String,
    /// Optional free-text description.
    pub description: Option<String>,
    /// JSON array of tags.
    pub tags: String,
    /// When the robot was created.
    pub created_at: DateTime<Utc>,
    /// When the robot was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Published robot version record.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct RobotVersionRecord {
    /// Unique identifier.
    pub id: String,
    /// Owning robot.
    pub robot_id: String,
    /// SemVer version string, unique per robot.
    pub version: String,
    /// Release channel.
    pub channel: Channel,
    /// Artifact packaging.
    pub artifact_kind: ArtifactKind,
    /// sha256 hex digest keying the artifact bytes in the blob store.
    pub artifact_digest: String,
    /// How the entrypoint is invoked.
    pub entrypoint_kind: EntrypointKind,
    /// Entrypoint path inside the extracted workspace.
    pub entrypoint_path: String,
    /// JSON array of default arguments.
    pub default_arguments: String,
    /// JSON object of default env vars.
    pub default_env: String,
    /// Optional working directory override.
    pub working_dir: Option<String>,
    /// JSON array of env keys that must be bound before a run may spawn.
    pub required_env_keys: String,
    /// Optional changelog text.
    pub changelog: Option<String>,
    /// Source commit, when published by CI.
    pub commit_sha: Option<String>,
    /// Source branch, when published by CI.
    pub branch: Option<String>,
    /// Build URL, when published by CI.
    pub build_url: Option<String>,
    /// "user" or "ci".
    pub created_source: String,
    /// Whether this is the robot's active version.
    pub is_active: bool,
    /// When the version was published.
    pub created_at: DateTime<Utc>,
}

impl RobotVersionRecord {
    /// Decode the default argument list.
    pub fn arguments(&self) -> Vec<String> {
        serde_json::from_str(&self.default_arguments).unwrap_or_default()
    }

    /// Decode the default env map.
    pub fn env(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.default_env).unwrap_or_default()
    }

    /// Decode the required env key set.
    pub fn required_keys(&self) -> Vec<String> {
        serde_json::from_str(&self.required_env_keys).unwrap_or_default()
    }
}

/// Fields of a version being published.
#[derive(Debug, Clone)]
pub struct NewVersion {
    /// Unique identifier.
    pub id: String,
    /// Owning robot.
    pub robot_id: String,
    /// SemVer version string.
    pub version: String,
    /// Release channel.
    pub channel: Channel,
    /// Artifact packaging.
    pub artifact_kind: ArtifactKind,
    /// sha256 hex digest of the artifact bytes.
    pub artifact_digest: String,
    /// How the entrypoint is invoked.
    pub entrypoint_kind: EntrypointKind,
    /// Entrypoint path.
    pub entrypoint_path: String,
    /// Default argument list.
    pub default_arguments: Vec<String>,
    /// Default env map.
    pub default_env: HashMap<String, String>,
    /// Optional working directory override.
    pub working_dir: Option<String>,
    /// Env keys that must be bound before spawn.
    pub required_env_keys: Vec<String>,
    /// Optional changelog.
    pub changelog: Option<String>,
    /// Source commit (CI publishes).
    pub commit_sha: Option<String>,
    /// Source branch (CI publishes).
    pub branch: Option<String>,
    /// Build URL (CI publishes).
    pub build_url: Option<String>,
    /// "user" or "ci".
    pub created_source: String,
    /// Whether to activate immediately.
    pub is_active: bool,
}

/// Schedule record (one per robot).
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ScheduleRecord {
    /// Unique identifier.
    pub id: String,
    /// Owning robot.
    pub robot_id: String,
    /// Whether the scheduler considers this schedule.
    pub enabled: bool,
    /// 5-field cron expression.
    pub cron_expr: String,
    /// IANA timezone the cron expression is evaluated in.
    pub timezone: String,
    /// Optional window start "HH:MM" (local time).
    pub window_start: Option<String>,
    /// Optional window end "HH:MM" (local time).
    pub window_end: Option<String>,
    /// Per-robot cap on simultaneously RUNNING runs.
    pub max_concurrency: i64,
    /// Effective run timeout in seconds.
    pub timeout_seconds: i64,
    /// Automatic retries after FAILED.
    pub retry_count: i64,
    /// Delay before a retry becomes claimable.
    pub retry_backoff_seconds: i64,
    /// Watermark of the last successful scheduler cycle.
    pub last_tick_at: Option<DateTime<Utc>>,
    /// When the schedule was created.
    pub created_at: DateTime<Utc>,
}

/// Mutable schedule fields, used for create and full update.
#[derive(Debug, Clone)]
pub struct ScheduleSpec {
    /// Whether the scheduler considers this schedule.
    pub enabled: bool,
    /// 5-field cron expression.
    pub cron_expr: String,
    /// IANA timezone name.
    pub timezone: String,
    /// Optional window start "HH:MM".
    pub window_start: Option<String>,
    /// Optional window end "HH:MM".
    pub window_end: Option<String>,
    /// Per-robot concurrency cap, ≥ 1.
    pub max_concurrency: i64,
    /// Run timeout in seconds, ≥ 1.
    pub timeout_seconds: i64,
    /// Automatic retries after FAILED, ≥ 0.
    pub retry_count: i64,
    /// Retry delay in seconds, ≥ 1.
    pub retry_backoff_seconds: i64,
}

/// SLA rule record (one per robot).
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct SlaRuleRecord {
    /// Unique identifier.
    pub id: String,
    /// Owning robot.
    pub robot_id: String,
    /// Expected cadence between successful runs, in minutes.
    pub expected_every_minutes: Option<i64>,
    /// Expected daily completion time "HH:MM" (local).
    pub expected_daily_time: Option<String>,
    /// Tolerance added before a LATE alert opens.
    pub late_after_minutes: i64,
    /// Whether failure streaks alert.
    pub alert_on_failure: bool,
    /// Whether lateness alerts.
    pub alert_on_late: bool,
    /// Opaque notification routing map (JSON).
    pub notify_channels: String,
    /// When the rule was created.
    pub created_at: DateTime<Utc>,
    /// When the rule was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Mutable SLA rule fields.
#[derive(Debug, Clone)]
pub struct SlaRuleSpec {
    /// Expected cadence in minutes.
    pub expected_every_minutes: Option<i64>,
    /// Expected daily completion time "HH:MM".
    pub expected_daily_time: Option<String>,
    /// Tolerance in minutes, ≥ 1.
    pub late_after_minutes: i64,
    /// Whether failure streaks alert.
    pub alert_on_failure: bool,
    /// Whether lateness alerts.
    pub alert_on_late: bool,
    /// Opaque notification routing map.
    pub notify_channels: serde_json::Value,
}

/// Env binding record for `(robot, env_name, key)`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnvBindingRecord {
    /// Owning robot.
    pub robot_id: String,
    /// Environment the binding applies to.
    pub env_name: EnvName,
    /// Env var name.
    pub key: String,
    /// Ciphertext envelope of the value.
    pub value: String,
    /// Whether the API must redact the value.
    pub is_secret: bool,
    /// When the binding was created.
    pub created_at: DateTime<Utc>,
    /// When the binding was last updated.
    pub updated_at: DateTime<Utc>,
}

/// Run record from the persistence layer.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct RunRecord {
    /// Unique identifier.
    pub run_id: String,
    /// Robot the run belongs to.
    pub robot_id: String,
    /// Exact version executed.
    pub robot_version_id: String,
    /// Originating self-service entry, if any.
    pub service_id: Option<String>,
    /// Originating schedule, if SCHEDULED or RETRY of a scheduled run.
    pub schedule_id: Option<String>,
    /// Cron fire time that produced the run (idempotency key half).
    pub fire_time: Option<DateTime<Utc>>,
    /// Environment executed against.
    pub env_name: EnvName,
    /// Origin of the run.
    pub trigger_type: TriggerType,
    /// 1 for first attempts, incremented by retries.
    pub attempt: i64,
    /// JSON array of runtime arguments.
    pub runtime_arguments: String,
    /// JSON object of runtime env overrides.
    pub runtime_env: String,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// When the run was accepted.
    pub queued_at: DateTime<Utc>,
    /// When the child was reported started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in seconds.
    pub duration_seconds: Option<f64>,
    /// User that triggered the run, if any.
    pub triggered_by: Option<String>,
    /// Worker that claimed the run.
    pub claimed_by: Option<String>,
    /// Host the run executed on.
    pub host_name: Option<String>,
    /// Child process id.
    pub process_id: Option<i64>,
    /// Failure detail for FAILED runs.
    pub error_message: Option<String>,
    /// Cooperative cancellation flag.
    pub cancel_requested: bool,
    /// When cancellation was requested.
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// When the run became CANCELED.
    pub canceled_at: Option<DateTime<Utc>>,
    /// User that requested cancellation.
    pub canceled_by: Option<String>,
}

impl RunRecord {
    /// Decode the runtime argument list.
    pub fn arguments(&self) -> Vec<String> {
        serde_json::from_str(&self.runtime_arguments).unwrap_or_default()
    }

    /// Decode the runtime env map.
    pub fn env(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.runtime_env).unwrap_or_default()
    }
}

/// Fields of a run being created.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Unique identifier.
    pub run_id: String,
    /// Robot the run belongs to.
    pub robot_id: String,
    /// Exact version to execute.
    pub robot_version_id: String,
    /// Originating self-service entry.
    pub service_id: Option<String>,
    /// Originating schedule.
    pub schedule_id: Option<String>,
    /// Cron fire time, for SCHEDULED runs.
    pub fire_time: Option<DateTime<Utc>>,
    /// Environment to execute against.
    pub env_name: EnvName,
    /// Origin of the run.
    pub trigger_type: TriggerType,
    /// Attempt number, ≥ 1.
    pub attempt: i64,
    /// Runtime arguments appended after the version defaults.
    pub runtime_arguments: Vec<String>,
    /// Runtime env overlaid on defaults and bindings.
    pub runtime_env: HashMap<String, String>,
    /// When the run was accepted.
    pub queued_at: DateTime<Utc>,
    /// User that triggered the run.
    pub triggered_by: Option<String>,
}

/// Run log line record.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct RunLogRecord {
    /// Database primary key.
    pub id: i64,
    /// Run this line belongs to.
    pub run_id: String,
    /// Monotonic sequence within the run.
    pub seq: i64,
    /// When the line was recorded.
    pub timestamp: DateTime<Utc>,
    /// Severity of the line.
    pub level: LogLevel,
    /// Line content.
    pub message: String,
    /// Whether the line arrived after the run reached a terminal state.
    pub post_terminal: bool,
}

/// Output artifact record.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct RunArtifactRecord {
    /// Unique identifier.
    pub id: String,
    /// Run that produced the artifact.
    pub run_id: String,
    /// File name, unique per run.
    pub name: String,
    /// Absolute path on the worker host's shared data dir.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: i64,
    /// Optional MIME type.
    pub content_type: Option<String>,
    /// When the artifact was registered.
    pub created_at: DateTime<Utc>,
}

/// Worker record.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct WorkerRecord {
    /// Stable worker identifier.
    pub worker_id: String,
    /// Host the worker runs on.
    pub hostname: String,
    /// Worker lifecycle status.
    pub status: WorkerStatus,
    /// Last heartbeat instant.
    pub last_heartbeat: DateTime<Utc>,
    /// Worker build version.
    pub version: Option<String>,
    /// When the worker first registered.
    pub created_at: DateTime<Utc>,
}

/// Alert event record.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct AlertRecord {
    /// Unique identifier.
    pub id: String,
    /// Robot the alert concerns (system sentinel for global alerts).
    pub robot_id: String,
    /// Related run, if any.
    pub run_id: Option<String>,
    /// Alert category.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    /// Alert severity.
    pub severity: AlertSeverity,
    /// Human-readable description.
    pub message: String,
    /// JSON evidence map.
    pub metadata: String,
    /// When the alert opened.
    pub created_at: DateTime<Utc>,
    /// When the alert was resolved; open while NULL.
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Queue entry record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueEntryRecord {
    /// Database primary key (insertion order tiebreak).
    pub id: i64,
    /// Run awaiting dispatch.
    pub run_id: String,
    /// Original acceptance time; FIFO position is preserved on requeue.
    pub queued_at: DateTime<Utc>,
    /// Entry is invisible to claims before this instant.
    pub not_before: Option<DateTime<Utc>>,
    /// Consecutive ineligible visits.
    pub deferrals: i64,
}

/// Filters for listing runs.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Filter by robot.
    pub robot_id: Option<String>,
    /// Filter by originating service.
    pub service_id: Option<String>,
    /// Filter by trigger type.
    pub trigger_type: Option<TriggerType>,
    /// Filter by status.
    pub status: Option<RunStatus>,
    /// Page size (default 50).
    pub limit: i64,
    /// Page offset.
    pub offset: i64,
}

/// Filters for listing alerts.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    /// `Some(true)` = open only, `Some(false)` = resolved only.
    pub open: Option<bool>,
    /// Filter by alert category.
    pub alert_type: Option<AlertType>,
    /// Filter by robot.
    pub robot_id: Option<String>,
    /// Page size (default 200).
    pub limit: i64,
}

/// Worker counters for the ops status endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerCounts {
    /// All registered workers.
    pub total: i64,
    /// Workers in RUNNING.
    pub running: i64,
    /// Workers in PAUSED.
    pub paused: i64,
}

/// Persistence interface used by the engine and background loops.
#[allow(missing_docs)]
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Robots & versions
    // ------------------------------------------------------------------

    async fn create_robot(
        &self,
        name: &str,
        description: Option<&str>,
        tags: &[String],
    ) -> Result<RobotRecord, CoreError>;

    async fn get_robot(&self, robot_id: &str) -> Result<Option<RobotRecord>, CoreError>;

    async fn get_robot_by_name(&self, name: &str) -> Result<Option<RobotRecord>, CoreError>;

    /// Insert a published version. Duplicate `(robot, version)` pairs are a
    /// `DuplicateVersion` error.
    async fn insert_version(&self, version: &NewVersion) -> Result<RobotVersionRecord, CoreError>;

    async fn get_version(&self, version_id: &str)
    -> Result<Option<RobotVersionRecord>, CoreError>;

    /// Fetch a version only if it belongs to the robot.
    async fn get_version_of_robot(
        &self,
        robot_id: &str,
        version_id: &str,
    ) -> Result<Option<RobotVersionRecord>, CoreError>;

    async fn get_active_version(
        &self,
        robot_id: &str,
    ) -> Result<Option<RobotVersionRecord>, CoreError>;

    /// Make `version_id` the robot's single active version.
    async fn activate_version(&self, robot_id: &str, version_id: &str) -> Result<(), CoreError>;

    // ------------------------------------------------------------------
    // Schedules & SLA rules
    // ------------------------------------------------------------------

    async fn create_schedule(
        &self,
        robot_id: &str,
        spec: &ScheduleSpec,
    ) -> Result<ScheduleRecord, CoreError>;

    async fn get_schedule(&self, robot_id: &str) -> Result<Option<ScheduleRecord>, CoreError>;

    async fn update_schedule(
        &self,
        robot_id: &str,
        spec: &ScheduleSpec,
    ) -> Result<ScheduleRecord, CoreError>;

    async fn delete_schedule(&self, robot_id: &str) -> Result<(), CoreError>;

    async fn list_enabled_schedules(&self) -> Result<Vec<ScheduleRecord>, CoreError>;

    async fn set_schedule_last_tick(
        &self,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    async fn create_sla_rule(
        &self,
        robot_id: &str,
        spec: &SlaRuleSpec,
    ) -> Result<SlaRuleRecord, CoreError>;

    async fn get_sla_rule(&self, robot_id: &str) -> Result<Option<SlaRuleRecord>, CoreError>;

    async fn update_sla_rule(
        &self,
        robot_id: &str,
        spec: &SlaRuleSpec,
    ) -> Result<SlaRuleRecord, CoreError>;

    async fn list_sla_rules(&self) -> Result<Vec<SlaRuleRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Env bindings
    // ------------------------------------------------------------------

    async fn upsert_env_binding(
        &self,
        robot_id: &str,
        env_name: EnvName,
        key: &str,
        ciphertext: &str,
        is_secret: bool,
    ) -> Result<(), CoreError>;

    async fn list_env_bindings(
        &self,
        robot_id: &str,
        env_name: EnvName,
    ) -> Result<Vec<EnvBindingRecord>, CoreError>;

    /// Returns true when a binding row was deleted.
    async fn delete_env_binding(
        &self,
        robot_id: &str,
        env_name: EnvName,
        key: &str,
    ) -> Result<bool, CoreError>;

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    /// Insert a PENDING run. Duplicate `(schedule_id, fire_time)` pairs are
    /// a `DuplicateFire` error.
    async fn insert_run(&self, run: &NewRun) -> Result<RunRecord, CoreError>;

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError>;

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, CoreError>;

    async fn count_running_for_robot(&self, robot_id: &str) -> Result<i64, CoreError>;

    /// PENDING or RUNNING runs created by a schedule (saturation check).
    async fn count_active_for_schedule(&self, schedule_id: &str) -> Result<i64, CoreError>;

    /// PENDING → RUNNING, recording the claiming worker. The per-robot
    /// concurrency check rides inside the same conditional update so the
    /// cap cannot be raced past by concurrent claimers. Returns false if
    /// the run was no longer PENDING or the robot is at its cap.
    async fn mark_run_running(
        &self,
        run_id: &str,
        worker_id: &str,
        max_concurrency: i64,
    ) -> Result<bool, CoreError>;

    /// Record started_at/host/pid for a RUNNING run. Idempotent.
    async fn set_run_started(
        &self,
        run_id: &str,
        host_name: &str,
        process_id: Option<i64>,
        started_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// RUNNING → terminal. Returns false if the run was not RUNNING.
    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        finished_at: DateTime<Utc>,
        duration_seconds: Option<f64>,
        error_message: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// PENDING → CANCELED. Returns false if the run was not PENDING.
    async fn cancel_pending_run(
        &self,
        run_id: &str,
        canceled_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Set the cancel flag on a RUNNING run. Returns false if the run was
    /// not RUNNING or the flag was already set.
    async fn request_cancel_running(
        &self,
        run_id: &str,
        canceled_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// RUNNING + cancel_requested → CANCELED (grace expiry).
    async fn force_cancel_run(&self, run_id: &str, at: DateTime<Utc>) -> Result<bool, CoreError>;

    /// PENDING → FAILED for dispatch-fatal conditions.
    async fn fail_pending_run(
        &self,
        run_id: &str,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    async fn list_running_runs(&self) -> Result<Vec<RunRecord>, CoreError>;

    /// Most recent terminal runs for a robot, newest first.
    async fn list_recent_terminal_runs(
        &self,
        robot_id: &str,
        limit: i64,
    ) -> Result<Vec<RunRecord>, CoreError>;

    /// Most recent SUCCESS run for a robot, by finished_at.
    async fn last_success_for_robot(
        &self,
        robot_id: &str,
    ) -> Result<Option<RunRecord>, CoreError>;

    async fn count_success_since(
        &self,
        robot_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, CoreError>;

    async fn count_runs_with_status(&self, status: RunStatus) -> Result<i64, CoreError>;

    async fn count_failed_since(&self, since: DateTime<Utc>) -> Result<i64, CoreError>;

    /// Delete terminal runs finished before the cutoff; cascades their
    /// logs and artifact rows. Returns rows deleted.
    async fn delete_terminal_runs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError>;

    // ------------------------------------------------------------------
    // Run logs & artifacts
    // ------------------------------------------------------------------

    /// Append a line with the next per-run sequence number.
    async fn append_run_log(
        &self,
        run_id: &str,
        level: LogLevel,
        message: &str,
        post_terminal: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<RunLogRecord, CoreError>;

    /// Ordered lines with `seq > after_seq`.
    async fn list_run_logs_since(
        &self,
        run_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<RunLogRecord>, CoreError>;

    async fn delete_logs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError>;

    async fn insert_artifact(
        &self,
        run_id: &str,
        name: &str,
        path: &str,
        size_bytes: i64,
        content_type: Option<&str>,
    ) -> Result<RunArtifactRecord, CoreError>;

    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<RunArtifactRecord>, CoreError>;

    async fn get_artifact(
        &self,
        artifact_id: &str,
    ) -> Result<Option<RunArtifactRecord>, CoreError>;

    /// Artifact rows older than the cutoff (for file removal before the
    /// row delete).
    async fn list_artifacts_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunArtifactRecord>, CoreError>;

    async fn delete_artifacts_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError>;

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Insert the worker as RUNNING or refresh hostname/version/heartbeat.
    async fn upsert_worker_heartbeat(
        &self,
        worker_id: &str,
        hostname: &str,
        version: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoreError>;

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, CoreError>;

    async fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<bool, CoreError>;

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, CoreError>;

    async fn count_workers(&self) -> Result<WorkerCounts, CoreError>;

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    /// Open an alert unless one is already open for `(robot, type)`.
    /// Returns None when an open alert already exists.
    async fn open_alert(
        &self,
        robot_id: &str,
        run_id: Option<&str>,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: &str,
        metadata: &serde_json::Value,
    ) -> Result<Option<AlertRecord>, CoreError>;

    async fn get_open_alert(
        &self,
        robot_id: &str,
        alert_type: AlertType,
    ) -> Result<Option<AlertRecord>, CoreError>;

    /// Resolve the open `(robot, type)` alert if one exists.
    async fn resolve_open_alert(
        &self,
        robot_id: &str,
        alert_type: AlertType,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    async fn get_alert(&self, alert_id: &str) -> Result<Option<AlertRecord>, CoreError>;

    /// Resolve by id; already-resolved alerts are left untouched.
    async fn resolve_alert(&self, alert_id: &str, at: DateTime<Utc>) -> Result<bool, CoreError>;

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>, CoreError>;

    // ------------------------------------------------------------------
    // Queue & control channel
    // ------------------------------------------------------------------

    /// Enqueue a run id. Duplicate pushes are absorbed (at-least-once).
    async fn queue_push(
        &self,
        run_id: &str,
        queued_at: DateTime<Utc>,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    /// Atomically pop the earliest visible entry.
    async fn queue_pop_candidate(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntryRecord>, CoreError>;

    /// Put an entry back at the tail, preserving its original queued_at.
    async fn queue_requeue(
        &self,
        run_id: &str,
        queued_at: DateTime<Utc>,
        deferrals: i64,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;

    /// Entries visible to claims right now.
    async fn queue_depth(&self, now: DateTime<Utc>) -> Result<i64, CoreError>;

    async fn queue_remove(&self, run_id: &str) -> Result<bool, CoreError>;

    async fn kill_signal_insert(&self, worker_id: &str, run_id: &str) -> Result<(), CoreError>;

    /// Drain pending kill signals addressed to a worker.
    async fn kill_signal_take(&self, worker_id: &str) -> Result<Vec<String>, CoreError>;

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn health_check(&self) -> Result<bool, CoreError>;
}
