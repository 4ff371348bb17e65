// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup enforcement loop.
//!
//! Workers are the primary enforcers of timeouts and cancellation; this
//! loop is the hub-side backstop for when a worker crashes or hangs:
//! overdue runs are failed with TIMEOUT, cancel requests past their grace
//! are forced to CANCELED (with a kill signal addressed to the owning
//! worker), and RUNNING runs of long-stale workers are failed with
//! "worker lost".

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use robohub_core::clock;
use robohub_core::engine::RunEngine;

/// How often the watchdog scans RUNNING runs.
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

/// Background loop for the non-cooperative exit paths.
pub struct Watchdog {
    engine: Arc<RunEngine>,
    shutdown: Arc<Notify>,
}

impl Watchdog {
    /// Create a new watchdog.
    pub fn new(engine: Arc<RunEngine>) -> Self {
        Self {
            engine,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the watchdog loop until shutdown.
    pub async fn run(&self) {
        info!(
            interval_secs = WATCHDOG_INTERVAL.as_secs(),
            "Watchdog started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Watchdog received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {
                    self.tick().await;
                }
            }
        }

        info!("Watchdog stopped");
    }

    async fn tick(&self) {
        let now = clock::now_utc();

        match self.engine.expire_timed_out_runs(now).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Watchdog timed out runs"),
            Err(e) => error!(error = %e, "Timeout sweep failed"),
        }
        match self.engine.expire_cancel_grace(now).await {
            Ok(0) => {}
            Ok(count) => info!(count, "Watchdog force-canceled runs"),
            Err(e) => error!(error = %e, "Cancel grace sweep failed"),
        }
        match self.engine.fail_runs_of_lost_workers(now).await {
            Ok(0) => debug!("Watchdog sweep complete"),
            Ok(count) => info!(count, "Watchdog failed runs of lost workers"),
            Err(e) => error!(error = %e, "Lost worker sweep failed"),
        }
    }
}
