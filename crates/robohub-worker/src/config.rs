// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// SQLite connection string shared with the hub.
    pub database_url: String,
    /// Artifacts and run scratch space, shared with the hub.
    pub data_dir: PathBuf,
    /// File persisting the stable worker id across restarts.
    pub worker_id_file: PathBuf,
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Claim poll period.
    pub claim_interval: Duration,
    /// Cancel flag poll period.
    pub cancel_poll_interval: Duration,
    /// Grace between SIGTERM and SIGKILL, and for cancel observation.
    pub cancel_grace: Duration,
    /// Shutdown drain budget for in-flight runs.
    pub drain_timeout: Duration,
    /// Maximum runs executing concurrently on this host.
    pub max_parallel_runs: usize,
    /// Interpreter used for script entrypoints.
    pub python_executable: String,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, robohub_core::config::ConfigError> {
        use robohub_core::config::ConfigError;

        let database_url = std::env::var("ROBOHUB_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("ROBOHUB_DATABASE_URL"))?;
        let data_dir: PathBuf = std::env::var("DATA_DIR")
            .unwrap_or_else(|_| ".data".to_string())
            .into();
        let worker_id_file = std::env::var("WORKER_ID_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("worker.id"));

        Ok(Self {
            database_url,
            worker_id_file,
            heartbeat_interval: Duration::from_secs(parse_env(
                "HEARTBEAT_INTERVAL_SECONDS",
                15,
            )?),
            claim_interval: Duration::from_secs(parse_env("CLAIM_POLL_INTERVAL_SECONDS", 1)?),
            cancel_poll_interval: Duration::from_secs(parse_env(
                "CANCEL_POLL_INTERVAL_SECONDS",
                2,
            )?),
            cancel_grace: Duration::from_secs(parse_env("CANCEL_GRACE_SECONDS", 30)?),
            drain_timeout: Duration::from_secs(parse_env("WORKER_DRAIN_TIMEOUT_SECONDS", 60)?),
            max_parallel_runs: parse_env("WORKER_MAX_PARALLEL_RUNS", 4)?,
            python_executable: std::env::var("PYTHON_EXECUTABLE")
                .unwrap_or_else(|_| "python3".to_string()),
            data_dir,
        })
    }

    /// Load the stable worker id, creating and persisting one on first run.
    pub fn load_or_create_worker_id(&self) -> std::io::Result<String> {
        if let Ok(existing) = std::fs::read_to_string(&self.worker_id_file) {
            let trimmed = existing.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        let id = Uuid::new_v4().to_string();
        if let Some(parent) = self.worker_id_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.worker_id_file, &id)?;
        Ok(id)
    }
}

fn parse_env<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, robohub_core::config::ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            robohub_core::config::ConfigError::Invalid(name, "must be a valid number")
        }),
        Err(_) => Ok(default),
    }
}
