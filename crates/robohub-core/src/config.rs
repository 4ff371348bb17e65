// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared configuration loaded from environment variables.

use std::time::Duration;

/// Configuration shared by the server, worker and background loops.
///
/// Required:
/// - `ROBOHUB_DATABASE_URL`: SQLite connection string or file path
///
/// Optional (with defaults):
/// - `APP_TIMEZONE`: fallback IANA timezone (default: UTC)
/// - `DATA_DIR`: artifacts and run scratch space (default: .data)
/// - `SCHEDULER_INTERVAL_SECONDS` (default: 30)
/// - `SLA_MONITOR_INTERVAL_SECONDS` (default: 60)
/// - `QUEUE_BACKLOG_ALERT_THRESHOLD` (default: 50)
/// - `WORKER_STALE_SECONDS` (default: 180)
/// - `FAILURE_STREAK_THRESHOLD` (default: 3)
/// - `DEFAULT_MANUAL_TIMEOUT_SECONDS` (default: 3600)
/// - `CANCEL_GRACE_SECONDS` (default: 30)
/// - `WATCHDOG_MARGIN_SECONDS` (default: 15)
/// - `RUN_RETENTION_DAYS` (default: 90)
/// - `LOG_RETENTION_DAYS` (default: 30)
/// - `ARTIFACT_RETENTION_DAYS` (default: 30)
/// - `CLEANUP_INTERVAL_SECONDS` (default: 3600)
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// SQLite connection string or database file path.
    pub database_url: String,
    /// Fallback IANA timezone name for schedules and SLA rules.
    pub app_timezone: String,
    /// Root directory for artifact blobs and run scratch space.
    pub data_dir: std::path::PathBuf,
    /// Scheduler tick period.
    pub scheduler_interval: Duration,
    /// SLA monitor tick period.
    pub sla_monitor_interval: Duration,
    /// Queue depth at which a QUEUE_BACKLOG alert opens.
    pub queue_backlog_alert_threshold: i64,
    /// Seconds without a heartbeat before a worker is stale.
    pub worker_stale_seconds: i64,
    /// Consecutive FAILED runs that open a FAILURE_STREAK alert.
    pub failure_streak_threshold: i64,
    /// Effective timeout for runs without a schedule.
    pub default_manual_timeout_seconds: i64,
    /// Grace period between a cancel request and a forced CANCELED.
    pub cancel_grace_seconds: i64,
    /// Extra margin the watchdog grants over a run's timeout.
    pub watchdog_margin_seconds: i64,
    /// Days terminal runs are retained.
    pub run_retention_days: i64,
    /// Days run logs are retained.
    pub log_retention_days: i64,
    /// Days run artifacts are retained.
    pub artifact_retention_days: i64,
    /// Cleanup tick period.
    pub cleanup_interval: Duration,
}

impl CoreConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("ROBOHUB_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("ROBOHUB_DATABASE_URL"))?;

        Ok(Self {
            database_url,
            app_timezone: env_or("APP_TIMEZONE", "UTC"),
            data_dir: env_or("DATA_DIR", ".data").into(),
            scheduler_interval: Duration::from_secs(env_parse(
                "SCHEDULER_INTERVAL_SECONDS",
                30,
            )?),
            sla_monitor_interval: Duration::from_secs(env_parse(
                "SLA_MONITOR_INTERVAL_SECONDS",
                60,
            )?),
            queue_backlog_alert_threshold: env_parse("QUEUE_BACKLOG_ALERT_THRESHOLD", 50)?,
            worker_stale_seconds: env_parse("WORKER_STALE_SECONDS", 180)?,
            failure_streak_threshold: env_parse("FAILURE_STREAK_THRESHOLD", 3)?,
            default_manual_timeout_seconds: env_parse("DEFAULT_MANUAL_TIMEOUT_SECONDS", 3600)?,
            cancel_grace_seconds: env_parse("CANCEL_GRACE_SECONDS", 30)?,
            watchdog_margin_seconds: env_parse("WATCHDOG_MARGIN_SECONDS", 15)?,
            run_retention_days: env_parse("RUN_RETENTION_DAYS", 90)?,
            log_retention_days: env_parse("LOG_RETENTION_DAYS", 30)?,
            artifact_retention_days: env_parse("ARTIFACT_RETENTION_DAYS", 30)?,
            cleanup_interval: Duration::from_secs(env_parse("CLEANUP_INTERVAL_SECONDS", 3600)?),
        })
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "must be a valid number")),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
