// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store implementation.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::{AlertSeverity, AlertType, EnvName, LogLevel, RunStatus, WorkerStatus};

use super::{
    AlertFilter, AlertRecord, EnvBindingRecord, NewRun, NewVersion, QueueEntryRecord, RobotRecord,
    RobotVersionRecord, RunArtifactRecord, RunFilter, RunLogRecord, RunRecord, ScheduleRecord,
    ScheduleSpec, SlaRuleRecord, SlaRuleSpec, Store, WorkerCounts, WorkerRecord,
};

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Borrow the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create and initialize a store from a connection URL.
    ///
    /// Accepts `sqlite:///abs/path`, `sqlite:path` or a bare file path.
    pub async fn from_url(url: &str) -> Result<Self, CoreError> {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        Self::from_path(path).await
    }

    /// Create and initialize a store from a database file path.
    ///
    /// Creates parent directories and the database file as needed, enables
    /// WAL and foreign keys (log/artifact cascades depend on them), and
    /// runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                    operation: "create_dir".to_string(),
                    details: format!("Failed to create directory {:?}: {}", parent, e),
                })?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        crate::migrations::run_sqlite(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().map(|db| db.kind()),
        Some(sqlx::error::ErrorKind::UniqueViolation)
    )
}

const RUN_COLUMNS: &str = "run_id, robot_id, robot_version_id, service_id, schedule_id, \
     fire_time, env_name, trigger_type, attempt, runtime_arguments, runtime_env, status, \
     queued_at, started_at, finished_at, duration_seconds, triggered_by, claimed_by, \
     host_name, process_id, error_message, cancel_requested, cancel_requested_at, \
     canceled_at, canceled_by";

const VERSION_COLUMNS: &str = "id, robot_id, version, channel, artifact_kind, artifact_digest, \
     entrypoint_kind, entrypoint_path, default_arguments, default_env, working_dir, \
     required_env_keys, changelog, commit_sha, branch, build_url, created_source, is_active, \
     created_at";

#[async_trait::async_trait]
impl Store for SqliteStore {
    // ------------------------------------------------------------------
    // Robots & versions
    // ------------------------------------------------------------------

    async fn create_robot(
        &self,
        name: &str,
        description: Option<&str>,
        tags: &[String],
    ) -> Result<RobotRecord, CoreError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, RobotRecord>(
            r#"
            INSERT INTO robots (id, name, description, tags, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, name, description, tags, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(name)
        .bind(description)
        .bind(serde_json::to_string(tags)?)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::ValidationError {
                    field: "name".to_string(),
                    message: format!("robot '{}' already exists", name),
                }
            } else {
                e.into()
            }
        })?;

        Ok(record)
    }

    async fn get_robot(&self, robot_id: &str) -> Result<Option<RobotRecord>, CoreError> {
        let record = sqlx::query_as::<_, RobotRecord>(
            "SELECT id, name, description, tags, created_at, updated_at FROM robots WHERE id = ?",
        )
        .bind(robot_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_robot_by_name(&self, name: &str) -> Result<Option<RobotRecord>, CoreError> {
        let record = sqlx::query_as::<_, RobotRecord>(
            "SELECT id, name, description, tags, created_at, updated_at FROM robots WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn insert_version(&self, version: &NewVersion) -> Result<RobotVersionRecord, CoreError> {
        let sql = format!(
            r#"
            INSERT INTO robot_versions ({VERSION_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {VERSION_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, RobotVersionRecord>(&sql)
            .bind(&version.id)
            .bind(&version.robot_id)
            .bind(&version.version)
            .bind(version.channel)
            .bind(version.artifact_kind)
            .bind(&version.artifact_digest)
            .bind(version.entrypoint_kind)
            .bind(&version.entrypoint_path)
            .bind(serde_json::to_string(&version.default_arguments)?)
            .bind(serde_json::to_string(&version.default_env)?)
            .bind(&version.working_dir)
            .bind(serde_json::to_string(&version.required_env_keys)?)
            .bind(&version.changelog)
            .bind(&version.commit_sha)
            .bind(&version.branch)
            .bind(&version.build_url)
            .bind(&version.created_source)
            .bind(version.is_active)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    CoreError::DuplicateVersion {
                        robot_id: version.robot_id.clone(),
                        version: version.version.clone(),
                    }
                } else {
                    e.into()
                }
            })?;

        Ok(record)
    }

    async fn get_version(
        &self,
        version_id: &str,
    ) -> Result<Option<RobotVersionRecord>, CoreError> {
        let sql = format!("SELECT {VERSION_COLUMNS} FROM robot_versions WHERE id = ?");
        let record = sqlx::query_as::<_, RobotVersionRecord>(&sql)
            .bind(version_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn get_version_of_robot(
        &self,
        robot_id: &str,
        version_id: &str,
    ) -> Result<Option<RobotVersionRecord>, CoreError> {
        let sql =
            format!("SELECT {VERSION_COLUMNS} FROM robot_versions WHERE id = ? AND robot_id = ?");
        let record = sqlx::query_as::<_, RobotVersionRecord>(&sql)
            .bind(version_id)
            .bind(robot_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn get_active_version(
        &self,
        robot_id: &str,
    ) -> Result<Option<RobotVersionRecord>, CoreError> {
        let sql = format!(
            "SELECT {VERSION_COLUMNS} FROM robot_versions \
             WHERE robot_id = ? AND is_active = 1 ORDER BY created_at DESC LIMIT 1"
        );
        let record = sqlx::query_as::<_, RobotVersionRecord>(&sql)
            .bind(robot_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn activate_version(&self, robot_id: &str, version_id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM robot_versions WHERE id = ? AND robot_id = ?")
                .bind(version_id)
                .bind(robot_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(CoreError::VersionNotFound {
                version_ref: version_id.to_string(),
            });
        }

        sqlx::query("UPDATE robot_versions SET is_active = 0 WHERE robot_id = ?")
            .bind(robot_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE robot_versions SET is_active = 1 WHERE id = ?")
            .bind(version_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Schedules & SLA rules
    // ------------------------------------------------------------------

    async fn create_schedule(
        &self,
        robot_id: &str,
        spec: &ScheduleSpec,
    ) -> Result<ScheduleRecord, CoreError> {
        let record = sqlx::query_as::<_, ScheduleRecord>(
            r#"
            INSERT INTO schedules (
                id, robot_id, enabled, cron_expr, timezone, window_start, window_end,
                max_concurrency, timeout_seconds, retry_count, retry_backoff_seconds,
                last_tick_at, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
            RETURNING id, robot_id, enabled, cron_expr, timezone, window_start, window_end,
                      max_concurrency, timeout_seconds, retry_count, retry_backoff_seconds,
                      last_tick_at, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(robot_id)
        .bind(spec.enabled)
        .bind(&spec.cron_expr)
        .bind(&spec.timezone)
        .bind(&spec.window_start)
        .bind(&spec.window_end)
        .bind(spec.max_concurrency)
        .bind(spec.timeout_seconds)
        .bind(spec.retry_count)
        .bind(spec.retry_backoff_seconds)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::ScheduleExists {
                    robot_id: robot_id.to_string(),
                }
            } else {
                e.into()
            }
        })?;

        Ok(record)
    }

    async fn get_schedule(&self, robot_id: &str) -> Result<Option<ScheduleRecord>, CoreError> {
        let record = sqlx::query_as::<_, ScheduleRecord>(
            "SELECT id, robot_id, enabled, cron_expr, timezone, window_start, window_end, \
             max_concurrency, timeout_seconds, retry_count, retry_backoff_seconds, \
             last_tick_at, created_at FROM schedules WHERE robot_id = ?",
        )
        .bind(robot_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn update_schedule(
        &self,
        robot_id: &str,
        spec: &ScheduleSpec,
    ) -> Result<ScheduleRecord, CoreError> {
        let record = sqlx::query_as::<_, ScheduleRecord>(
            r#"
            UPDATE schedules SET
                enabled = ?, cron_expr = ?, timezone = ?, window_start = ?, window_end = ?,
                max_concurrency = ?, timeout_seconds = ?, retry_count = ?,
                retry_backoff_seconds = ?
            WHERE robot_id = ?
            RETURNING id, robot_id, enabled, cron_expr, timezone, window_start, window_end,
                      max_concurrency, timeout_seconds, retry_count, retry_backoff_seconds,
                      last_tick_at, created_at
            "#,
        )
        .bind(spec.enabled)
        .bind(&spec.cron_expr)
        .bind(&spec.timezone)
        .bind(&spec.window_start)
        .bind(&spec.window_end)
        .bind(spec.max_concurrency)
        .bind(spec.timeout_seconds)
        .bind(spec.retry_count)
        .bind(spec.retry_backoff_seconds)
        .bind(robot_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| CoreError::ScheduleNotFound {
            robot_id: robot_id.to_string(),
        })
    }

    async fn delete_schedule(&self, robot_id: &str) -> Result<(), CoreError> {
        let result = sqlx::query("DELETE FROM schedules WHERE robot_id = ?")
            .bind(robot_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::ScheduleNotFound {
                robot_id: robot_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_enabled_schedules(&self) -> Result<Vec<ScheduleRecord>, CoreError> {
        let records = sqlx::query_as::<_, ScheduleRecord>(
            "SELECT id, robot_id, enabled, cron_expr, timezone, window_start, window_end, \
             max_concurrency, timeout_seconds, retry_count, retry_backoff_seconds, \
             last_tick_at, created_at FROM schedules WHERE enabled = 1 ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn set_schedule_last_tick(
        &self,
        schedule_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE schedules SET last_tick_at = ? WHERE id = ?")
            .bind(at)
            .bind(schedule_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_sla_rule(
        &self,
        robot_id: &str,
        spec: &SlaRuleSpec,
    ) -> Result<SlaRuleRecord, CoreError> {
        let now = Utc::now();
        let record = sqlx::query_as::<_, SlaRuleRecord>(
            r#"
            INSERT INTO sla_rules (
                id, robot_id, expected_every_minutes, expected_daily_time,
                late_after_minutes, alert_on_failure, alert_on_late, notify_channels,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, robot_id, expected_every_minutes, expected_daily_time,
                      late_after_minutes, alert_on_failure, alert_on_late, notify_channels,
                      created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(robot_id)
        .bind(spec.expected_every_minutes)
        .bind(&spec.expected_daily_time)
        .bind(spec.late_after_minutes)
        .bind(spec.alert_on_failure)
        .bind(spec.alert_on_late)
        .bind(serde_json::to_string(&spec.notify_channels)?)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::SlaRuleExists {
                    robot_id: robot_id.to_string(),
                }
            } else {
                e.into()
            }
        })?;

        Ok(record)
    }

    async fn get_sla_rule(&self, robot_id: &str) -> Result<Option<SlaRuleRecord>, CoreError> {
        let record = sqlx::query_as::<_, SlaRuleRecord>(
            "SELECT id, robot_id, expected_every_minutes, expected_daily_time, \
             late_after_minutes, alert_on_failure, alert_on_late, notify_channels, \
             created_at, updated_at FROM sla_rules WHERE robot_id = ?",
        )
        .bind(robot_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn update_sla_rule(
        &self,
        robot_id: &str,
        spec: &SlaRuleSpec,
    ) -> Result<SlaRuleRecord, CoreError> {
        let record = sqlx::query_as::<_, SlaRuleRecord>(
            r#"
            UPDATE sla_rules SET
                expected_every_minutes = ?, expected_daily_time = ?, late_after_minutes = ?,
                alert_on_failure = ?, alert_on_late = ?, notify_channels = ?, updated_at = ?
            WHERE robot_id = ?
            RETURNING id, robot_id, expected_every_minutes, expected_daily_time,
                      late_after_minutes, alert_on_failure, alert_on_late, notify_channels,
                      created_at, updated_at
            "#,
        )
        .bind(spec.expected_every_minutes)
        .bind(&spec.expected_daily_time)
        .bind(spec.late_after_minutes)
        .bind(spec.alert_on_failure)
        .bind(spec.alert_on_late)
        .bind(serde_json::to_string(&spec.notify_channels)?)
        .bind(Utc::now())
        .bind(robot_id)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| CoreError::SlaRuleNotFound {
            robot_id: robot_id.to_string(),
        })
    }

    async fn list_sla_rules(&self) -> Result<Vec<SlaRuleRecord>, CoreError> {
        let records = sqlx::query_as::<_, SlaRuleRecord>(
            "SELECT id, robot_id, expected_every_minutes, expected_daily_time, \
             late_after_minutes, alert_on_failure, alert_on_late, notify_channels, \
             created_at, updated_at FROM sla_rules ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

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
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO robot_env_bindings
                (robot_id, env_name, key, value, is_secret, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (robot_id, env_name, key) DO UPDATE SET
                value = excluded.value,
                is_secret = excluded.is_secret,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(robot_id)
        .bind(env_name)
        .bind(key)
        .bind(ciphertext)
        .bind(is_secret)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_env_bindings(
        &self,
        robot_id: &str,
        env_name: EnvName,
    ) -> Result<Vec<EnvBindingRecord>, CoreError> {
        let records = sqlx::query_as::<_, EnvBindingRecord>(
            "SELECT robot_id, env_name, key, value, is_secret, created_at, updated_at \
             FROM robot_env_bindings WHERE robot_id = ? AND env_name = ? ORDER BY key",
        )
        .bind(robot_id)
        .bind(env_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn delete_env_binding(
        &self,
        robot_id: &str,
        env_name: EnvName,
        key: &str,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "DELETE FROM robot_env_bindings WHERE robot_id = ? AND env_name = ? AND key = ?",
        )
        .bind(robot_id)
        .bind(env_name)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------

    async fn insert_run(&self, run: &NewRun) -> Result<RunRecord, CoreError> {
        let sql = format!(
            r#"
            INSERT INTO runs (
                run_id, robot_id, robot_version_id, service_id, schedule_id, fire_time,
                env_name, trigger_type, attempt, runtime_arguments, runtime_env,
                status, queued_at, triggered_by, cancel_requested
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?, ?, 0)
            RETURNING {RUN_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(&run.run_id)
            .bind(&run.robot_id)
            .bind(&run.robot_version_id)
            .bind(&run.service_id)
            .bind(&run.schedule_id)
            .bind(run.fire_time)
            .bind(run.env_name)
            .bind(run.trigger_type)
            .bind(run.attempt)
            .bind(serde_json::to_string(&run.runtime_arguments)?)
            .bind(serde_json::to_string(&run.runtime_env)?)
            .bind(run.queued_at)
            .bind(&run.triggered_by)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    CoreError::DuplicateFire {
                        schedule_id: run.schedule_id.clone().unwrap_or_default(),
                        fire_time: run
                            .fire_time
                            .map(|t| t.to_rfc3339())
                            .unwrap_or_default(),
                    }
                } else {
                    e.into()
                }
            })?;

        Ok(record)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, CoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?");
        let record = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, CoreError> {
        let limit = if filter.limit > 0 { filter.limit } else { 50 };
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS} FROM runs
            WHERE (?1 IS NULL OR robot_id = ?1)
              AND (?2 IS NULL OR service_id = ?2)
              AND (?3 IS NULL OR trigger_type = ?3)
              AND (?4 IS NULL OR status = ?4)
            ORDER BY queued_at DESC
            LIMIT ?5 OFFSET ?6
            "#
        );
        let records = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(&filter.robot_id)
            .bind(&filter.service_id)
            .bind(filter.trigger_type.map(|t| t.as_str()))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn count_running_for_robot(&self, robot_id: &str) -> Result<i64, CoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM runs WHERE robot_id = ? AND status = 'RUNNING'")
                .bind(robot_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn count_active_for_schedule(&self, schedule_id: &str) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM runs \
             WHERE schedule_id = ? AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(schedule_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn mark_run_running(
        &self,
        run_id: &str,
        worker_id: &str,
        max_concurrency: i64,
    ) -> Result<bool, CoreError> {
        // SQLite executes the statement under its single-writer lock, so
        // the in-flight count and the transition cannot be raced apart.
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = 'RUNNING', claimed_by = ?1
            WHERE run_id = ?2
              AND status = 'PENDING'
              AND (SELECT COUNT(*) FROM runs r
                   WHERE r.robot_id = runs.robot_id AND r.status = 'RUNNING') < ?3
            "#,
        )
        .bind(worker_id)
        .bind(run_id)
        .bind(max_concurrency)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_run_started(
        &self,
        run_id: &str,
        host_name: &str,
        process_id: Option<i64>,
        started_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE runs SET started_at = COALESCE(started_at, ?), host_name = ?, \
             process_id = ? WHERE run_id = ? AND status = 'RUNNING'",
        )
        .bind(started_at)
        .bind(host_name)
        .bind(process_id)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish_run(
        &self,
        run_id: &str,
        status: RunStatus,
        finished_at: DateTime<Utc>,
        duration_seconds: Option<f64>,
        error_message: Option<&str>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = ?1,
                finished_at = ?2,
                duration_seconds = ?3,
                error_message = ?4,
                canceled_at = CASE WHEN ?1 = 'CANCELED' THEN ?2 ELSE canceled_at END
            WHERE run_id = ?5 AND status = 'RUNNING'
            "#,
        )
        .bind(status)
        .bind(finished_at)
        .bind(duration_seconds)
        .bind(error_message)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_pending_run(
        &self,
        run_id: &str,
        canceled_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET
                status = 'CANCELED', cancel_requested = 1, cancel_requested_at = ?1,
                canceled_at = ?1, canceled_by = ?2, finished_at = ?1
            WHERE run_id = ?3 AND status = 'PENDING'
            "#,
        )
        .bind(at)
        .bind(canceled_by)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn request_cancel_running(
        &self,
        run_id: &str,
        canceled_by: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE runs SET cancel_requested = 1, cancel_requested_at = ?, canceled_by = ? \
             WHERE run_id = ? AND status = 'RUNNING' AND cancel_requested = 0",
        )
        .bind(at)
        .bind(canceled_by)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn force_cancel_run(&self, run_id: &str, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs SET status = 'CANCELED', canceled_at = ?1, finished_at = ?1
            WHERE run_id = ?2 AND status = 'RUNNING' AND cancel_requested = 1
            "#,
        )
        .bind(at)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail_pending_run(
        &self,
        run_id: &str,
        error_message: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE runs SET status = 'FAILED', finished_at = ?, error_message = ? \
             WHERE run_id = ? AND status = 'PENDING'",
        )
        .bind(at)
        .bind(error_message)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_running_runs(&self) -> Result<Vec<RunRecord>, CoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE status = 'RUNNING'");
        let records = sqlx::query_as::<_, RunRecord>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn list_recent_terminal_runs(
        &self,
        robot_id: &str,
        limit: i64,
    ) -> Result<Vec<RunRecord>, CoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE robot_id = ? AND status IN ('SUCCESS', 'FAILED', 'CANCELED') \
             ORDER BY finished_at DESC LIMIT ?"
        );
        let records = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(robot_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(records)
    }

    async fn last_success_for_robot(
        &self,
        robot_id: &str,
    ) -> Result<Option<RunRecord>, CoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs \
             WHERE robot_id = ? AND status = 'SUCCESS' ORDER BY finished_at DESC LIMIT 1"
        );
        let record = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(robot_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn count_success_since(
        &self,
        robot_id: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM runs \
             WHERE robot_id = ? AND status = 'SUCCESS' AND finished_at >= ?",
        )
        .bind(robot_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn count_runs_with_status(&self, status: RunStatus) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM runs WHERE status = ?")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_failed_since(&self, since: DateTime<Utc>) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM runs \
             WHERE status = 'FAILED' AND COALESCE(finished_at, queued_at) >= ?",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn delete_terminal_runs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM runs WHERE run_id IN (
                SELECT run_id FROM runs
                WHERE status IN ('SUCCESS', 'FAILED', 'CANCELED') AND finished_at < ?
                LIMIT ?
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Run logs & artifacts
    // ------------------------------------------------------------------

    async fn append_run_log(
        &self,
        run_id: &str,
        level: LogLevel,
        message: &str,
        post_terminal: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<RunLogRecord, CoreError> {
        // The seq is computed inside the insert; concurrent appenders can
        // collide on UNIQUE(run_id, seq), so retry a few times.
        for attempt in 0..4 {
            let result = sqlx::query_as::<_, RunLogRecord>(
                r#"
                INSERT INTO run_logs (run_id, seq, timestamp, level, message, post_terminal)
                SELECT ?1, COALESCE(MAX(seq) + 1, 0), ?2, ?3, ?4, ?5
                FROM run_logs WHERE run_id = ?1
                RETURNING id, run_id, seq, timestamp, level, message, post_terminal
                "#,
            )
            .bind(run_id)
            .bind(timestamp)
            .bind(level)
            .bind(message)
            .bind(post_terminal)
            .fetch_one(&self.pool)
            .await;

            match result {
                Ok(record) => return Ok(record),
                Err(e) if is_unique_violation(&e) && attempt < 3 => continue,
                Err(e) => return Err(e.into()),
            }
        }
        unreachable!("append_run_log retry loop always returns");
    }

    async fn list_run_logs_since(
        &self,
        run_id: &str,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<RunLogRecord>, CoreError> {
        let records = sqlx::query_as::<_, RunLogRecord>(
            "SELECT id, run_id, seq, timestamp, level, message, post_terminal \
             FROM run_logs WHERE run_id = ? AND seq > ? ORDER BY seq LIMIT ?",
        )
        .bind(run_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn delete_logs_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM run_logs WHERE id IN \
             (SELECT id FROM run_logs WHERE timestamp < ? LIMIT ?)",
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_artifact(
        &self,
        run_id: &str,
        name: &str,
        path: &str,
        size_bytes: i64,
        content_type: Option<&str>,
    ) -> Result<RunArtifactRecord, CoreError> {
        let record = sqlx::query_as::<_, RunArtifactRecord>(
            r#"
            INSERT INTO run_artifacts (id, run_id, name, path, size_bytes, content_type, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id, name) DO UPDATE SET
                path = excluded.path,
                size_bytes = excluded.size_bytes,
                content_type = excluded.content_type
            RETURNING id, run_id, name, path, size_bytes, content_type, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(run_id)
        .bind(name)
        .bind(path)
        .bind(size_bytes)
        .bind(content_type)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_artifacts(&self, run_id: &str) -> Result<Vec<RunArtifactRecord>, CoreError> {
        let records = sqlx::query_as::<_, RunArtifactRecord>(
            "SELECT id, run_id, name, path, size_bytes, content_type, created_at \
             FROM run_artifacts WHERE run_id = ? ORDER BY name",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn get_artifact(
        &self,
        artifact_id: &str,
    ) -> Result<Option<RunArtifactRecord>, CoreError> {
        let record = sqlx::query_as::<_, RunArtifactRecord>(
            "SELECT id, run_id, name, path, size_bytes, content_type, created_at \
             FROM run_artifacts WHERE id = ?",
        )
        .bind(artifact_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_artifacts_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RunArtifactRecord>, CoreError> {
        let records = sqlx::query_as::<_, RunArtifactRecord>(
            "SELECT id, run_id, name, path, size_bytes, content_type, created_at \
             FROM run_artifacts WHERE created_at < ? LIMIT ?",
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn delete_artifacts_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM run_artifacts WHERE id IN \
             (SELECT id FROM run_artifacts WHERE created_at < ? LIMIT ?)",
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    async fn upsert_worker_heartbeat(
        &self,
        worker_id: &str,
        hostname: &str,
        version: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<WorkerRecord, CoreError> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            r#"
            INSERT INTO workers (worker_id, hostname, status, last_heartbeat, version, created_at)
            VALUES (?1, ?2, 'RUNNING', ?3, ?4, ?3)
            ON CONFLICT (worker_id) DO UPDATE SET
                hostname = excluded.hostname,
                version = excluded.version,
                last_heartbeat = excluded.last_heartbeat
            RETURNING worker_id, hostname, status, last_heartbeat, version, created_at
            "#,
        )
        .bind(worker_id)
        .bind(hostname)
        .bind(at)
        .bind(version)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_worker(&self, worker_id: &str) -> Result<Option<WorkerRecord>, CoreError> {
        let record = sqlx::query_as::<_, WorkerRecord>(
            "SELECT worker_id, hostname, status, last_heartbeat, version, created_at \
             FROM workers WHERE worker_id = ?",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn set_worker_status(
        &self,
        worker_id: &str,
        status: WorkerStatus,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query("UPDATE workers SET status = ? WHERE worker_id = ?")
            .bind(status)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRecord>, CoreError> {
        let records = sqlx::query_as::<_, WorkerRecord>(
            "SELECT worker_id, hostname, status, last_heartbeat, version, created_at \
             FROM workers ORDER BY hostname, created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn count_workers(&self) -> Result<WorkerCounts, CoreError> {
        let (total, running, paused): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COALESCE(SUM(CASE WHEN status = 'RUNNING' THEN 1 ELSE 0 END), 0), \
                    COALESCE(SUM(CASE WHEN status = 'PAUSED' THEN 1 ELSE 0 END), 0) \
             FROM workers",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(WorkerCounts {
            total,
            running,
            paused,
        })
    }

    // ------------------------------------------------------------------
    // Alerts
    // ------------------------------------------------------------------

    async fn open_alert(
        &self,
        robot_id: &str,
        run_id: Option<&str>,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: &str,
        metadata: &serde_json::Value,
    ) -> Result<Option<AlertRecord>, CoreError> {
        let record = sqlx::query_as::<_, AlertRecord>(
            r#"
            INSERT INTO alert_events
                (id, robot_id, run_id, type, severity, message, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (robot_id, type) WHERE resolved_at IS NULL DO NOTHING
            RETURNING id, robot_id, run_id, type, severity, message, metadata,
                      created_at, resolved_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(robot_id)
        .bind(run_id)
        .bind(alert_type)
        .bind(severity)
        .bind(message)
        .bind(serde_json::to_string(metadata)?)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn get_open_alert(
        &self,
        robot_id: &str,
        alert_type: AlertType,
    ) -> Result<Option<AlertRecord>, CoreError> {
        let record = sqlx::query_as::<_, AlertRecord>(
            "SELECT id, robot_id, run_id, type, severity, message, metadata, created_at, \
             resolved_at FROM alert_events \
             WHERE robot_id = ? AND type = ? AND resolved_at IS NULL",
        )
        .bind(robot_id)
        .bind(alert_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn resolve_open_alert(
        &self,
        robot_id: &str,
        alert_type: AlertType,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            "UPDATE alert_events SET resolved_at = ? \
             WHERE robot_id = ? AND type = ? AND resolved_at IS NULL",
        )
        .bind(at)
        .bind(robot_id)
        .bind(alert_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_alert(&self, alert_id: &str) -> Result<Option<AlertRecord>, CoreError> {
        let record = sqlx::query_as::<_, AlertRecord>(
            "SELECT id, robot_id, run_id, type, severity, message, metadata, created_at, \
             resolved_at FROM alert_events WHERE id = ?",
        )
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn resolve_alert(&self, alert_id: &str, at: DateTime<Utc>) -> Result<bool, CoreError> {
        let result =
            sqlx::query("UPDATE alert_events SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL")
                .bind(at)
                .bind(alert_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<AlertRecord>, CoreError> {
        let limit = if filter.limit > 0 { filter.limit } else { 200 };
        let records = sqlx::query_as::<_, AlertRecord>(
            r#"
            SELECT id, robot_id, run_id, type, severity, message, metadata, created_at,
                   resolved_at
            FROM alert_events
            WHERE (?1 IS NULL OR (?1 = 1 AND resolved_at IS NULL)
                               OR (?1 = 0 AND resolved_at IS NOT NULL))
              AND (?2 IS NULL OR type = ?2)
              AND (?3 IS NULL OR robot_id = ?3)
            ORDER BY created_at DESC
            LIMIT ?4
            "#,
        )
        .bind(filter.open.map(|o| o as i64))
        .bind(filter.alert_type.map(|t| t.as_str()))
        .bind(&filter.robot_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Queue & control channel
    // ------------------------------------------------------------------

    async fn queue_push(
        &self,
        run_id: &str,
        queued_at: DateTime<Utc>,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO run_queue (run_id, queued_at, not_before, deferrals) \
             VALUES (?, ?, ?, 0) ON CONFLICT (run_id) DO NOTHING",
        )
        .bind(run_id)
        .bind(queued_at)
        .bind(not_before)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_pop_candidate(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<QueueEntryRecord>, CoreError> {
        let record = sqlx::query_as::<_, QueueEntryRecord>(
            r#"
            DELETE FROM run_queue WHERE id = (
                SELECT id FROM run_queue
                WHERE not_before IS NULL OR not_before <= ?
                ORDER BY queued_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id, run_id, queued_at, not_before, deferrals
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn queue_requeue(
        &self,
        run_id: &str,
        queued_at: DateTime<Utc>,
        deferrals: i64,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO run_queue (run_id, queued_at, not_before, deferrals)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (run_id) DO UPDATE SET
                not_before = excluded.not_before,
                deferrals = excluded.deferrals
            "#,
        )
        .bind(run_id)
        .bind(queued_at)
        .bind(not_before)
        .bind(deferrals)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn queue_depth(&self, now: DateTime<Utc>) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM run_queue WHERE not_before IS NULL OR not_before <= ?",
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn queue_remove(&self, run_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM run_queue WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn kill_signal_insert(&self, worker_id: &str, run_id: &str) -> Result<(), CoreError> {
        sqlx::query(
            "INSERT INTO kill_signals (worker_id, run_id, created_at) VALUES (?, ?, ?) \
             ON CONFLICT (worker_id, run_id) DO NOTHING",
        )
        .bind(worker_id)
        .bind(run_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn kill_signal_take(&self, worker_id: &str) -> Result<Vec<String>, CoreError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("DELETE FROM kill_signals WHERE worker_id = ? RETURNING run_id")
                .bind(worker_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(run_id,)| run_id).collect())
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    async fn health_check(&self) -> Result<bool, CoreError> {
        let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}
