// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retention cleanup loop.
//!
//! Deletes run logs, artifact files+rows and terminal runs past their
//! retention windows, in bounded batches so one cycle never holds the
//! database for long. Run deletion cascades any remaining logs and
//! artifact rows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use robohub_core::error::CoreError;
use robohub_core::persistence::Store;

/// Rows removed per batch.
const BATCH_SIZE: i64 = 500;

/// Retention configuration.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Tick period.
    pub interval: Duration,
    /// Days terminal runs are retained.
    pub run_retention_days: i64,
    /// Days run logs are retained.
    pub log_retention_days: i64,
    /// Days run artifacts are retained.
    pub artifact_retention_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            run_retention_days: 90,
            log_retention_days: 30,
            artifact_retention_days: 30,
        }
    }
}

/// Counters from one cleanup cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupResult {
    /// Log rows removed.
    pub removed_log_rows: u64,
    /// Artifact rows removed.
    pub removed_artifact_rows: u64,
    /// Artifact files unlinked.
    pub removed_artifact_files: u64,
    /// Terminal runs removed (cascading their logs/artifacts).
    pub removed_runs: u64,
}

/// Background worker enforcing retention policy.
pub struct RetentionWorker {
    store: Arc<dyn Store>,
    config: RetentionConfig,
    shutdown: Arc<Notify>,
}

impl RetentionWorker {
    /// Create a new retention worker.
    pub fn new(store: Arc<dyn Store>, config: RetentionConfig) -> Self {
        Self {
            store,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until shutdown.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            run_retention_days = self.config.run_retention_days,
            log_retention_days = self.config.log_retention_days,
            artifact_retention_days = self.config.artifact_retention_days,
            "Retention worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Retention worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_cycle(Utc::now()).await {
                        Ok(result)
                            if result.removed_log_rows > 0
                                || result.removed_artifact_rows > 0
                                || result.removed_runs > 0 =>
                        {
                            info!(
                                removed_log_rows = result.removed_log_rows,
                                removed_artifact_rows = result.removed_artifact_rows,
                                removed_artifact_files = result.removed_artifact_files,
                                removed_runs = result.removed_runs,
                                "Cleanup cycle completed"
                            );
                        }
                        Ok(_) => debug!("Cleanup cycle completed, nothing expired"),
                        Err(e) => error!(error = %e, "Cleanup cycle failed"),
                    }
                }
            }
        }

        info!("Retention worker stopped");
    }

    /// One retention pass over logs, artifacts and terminal runs.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CleanupResult, CoreError> {
        let mut result = CleanupResult::default();

        let log_cutoff = now - ChronoDuration::days(self.config.log_retention_days);
        let artifact_cutoff = now - ChronoDuration::days(self.config.artifact_retention_days);
        let run_cutoff = now - ChronoDuration::days(self.config.run_retention_days);

        // Artifact files first; the row delete would orphan them.
        loop {
            let batch = self
                .store
                .list_artifacts_before(artifact_cutoff, BATCH_SIZE)
                .await?;
            if batch.is_empty() {
                break;
            }
            for artifact in &batch {
                match tokio::fs::remove_file(&artifact.path).await {
                    Ok(()) => result.removed_artifact_files += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(path = %artifact.path, error = %e, "Failed to remove artifact file");
                    }
                }
            }
            let deleted = self
                .store
                .delete_artifacts_before(artifact_cutoff, BATCH_SIZE)
                .await?;
            result.removed_artifact_rows += deleted;
            if deleted < BATCH_SIZE as u64 {
                break;
            }
        }

        loop {
            let deleted = self
                .store
                .delete_logs_before(log_cutoff, BATCH_SIZE)
                .await?;
            result.removed_log_rows += deleted;
            if deleted < BATCH_SIZE as u64 {
                break;
            }
        }

        loop {
            let deleted = self
                .store
                .delete_terminal_runs_before(run_cutoff, BATCH_SIZE)
                .await?;
            result.removed_runs += deleted;
            if deleted < BATCH_SIZE as u64 {
                break;
            }
        }

        Ok(result)
    }
}
