// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker registration, heartbeat, claim and drain loops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use robohub_core::engine::RunEngine;
use robohub_core::model::WorkerStatus;
use robohub_core::persistence::Store;

use crate::config::WorkerConfig;
use crate::executor::{ActivePids, Executor};

/// The worker process: one per host.
pub struct Worker {
    engine: Arc<RunEngine>,
    executor: Arc<Executor>,
    config: WorkerConfig,
    worker_id: String,
    hostname: String,
    active_pids: ActivePids,
    shutdown: Arc<Notify>,
}

impl Worker {
    /// Create a worker with its executor.
    pub fn new(
        engine: Arc<RunEngine>,
        cipher: robohub_core::cipher::Cipher,
        config: WorkerConfig,
        worker_id: String,
    ) -> Self {
        let active_pids: ActivePids = Arc::new(Mutex::new(HashMap::new()));
        let executor = Arc::new(Executor::new(
            engine.clone(),
            cipher,
            config.clone(),
            active_pids.clone(),
        ));
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        Self {
            engine,
            executor,
            config,
            worker_id,
            hostname,
            active_pids,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the worker until shutdown, then drain in-flight runs.
    pub async fn run(&self) {
        info!(
            worker_id = %self.worker_id,
            hostname = %self.hostname,
            max_parallel_runs = self.config.max_parallel_runs,
            "Worker starting"
        );

        self.heartbeat().await;

        let capacity = Arc::new(Semaphore::new(self.config.max_parallel_runs.max(1)));
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut claim = tokio::time::interval(self.config.claim_interval);
        claim.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Worker received shutdown signal");
                    break;
                }

                _ = heartbeat.tick() => {
                    self.heartbeat().await;
                    self.process_kill_signals().await;
                }

                _ = claim.tick() => {
                    // Reap finished executor tasks without blocking.
                    while in_flight.try_join_next().is_some() {}

                    if capacity.available_permits() == 0 {
                        continue;
                    }
                    match self.engine.claim_next(&self.worker_id).await {
                        Ok(Some(claimed)) => {
                            let permit = capacity.clone().acquire_owned().await
                                .expect("semaphore never closes");
                            let executor = self.executor.clone();
                            in_flight.spawn(async move {
                                executor.execute(claimed).await;
                                drop(permit);
                            });
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, "Claim failed");
                        }
                    }
                }
            }
        }

        self.drain(in_flight).await;

        if let Err(e) = self
            .engine
            .store()
            .set_worker_status(&self.worker_id, WorkerStatus::Stopped)
            .await
        {
            warn!(error = %e, "Failed to mark worker stopped");
        }
        info!("Worker stopped");
    }

    /// Refresh the worker row; self-registers on first call.
    async fn heartbeat(&self) {
        if let Err(e) = self
            .engine
            .store()
            .upsert_worker_heartbeat(
                &self.worker_id,
                &self.hostname,
                Some(env!("CARGO_PKG_VERSION")),
                Utc::now(),
            )
            .await
        {
            error!(error = %e, "Heartbeat failed");
        }
    }

    /// Deliver force-kill signals addressed to this worker. The run is
    /// already CANCELED hub-side; this is the best-effort process kill.
    async fn process_kill_signals(&self) {
        let kills = match self.engine.queue().take_kills(&self.worker_id).await {
            Ok(kills) => kills,
            Err(e) => {
                warn!(error = %e, "Failed to read kill signals");
                return;
            }
        };
        for run_id in kills {
            let pid = self.active_pids.lock().unwrap().get(&run_id).copied();
            match pid {
                Some(pid) => {
                    warn!(run_id = %run_id, pid, "Force-killing run on hub request");
                    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        warn!(run_id = %run_id, pid, error = %e, "SIGKILL failed");
                    }
                }
                None => debug!(run_id = %run_id, "Kill signal for run not executing here"),
            }
        }
    }

    /// Wait up to the drain budget for in-flight runs to finish.
    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        info!(
            in_flight = in_flight.len(),
            drain_timeout_secs = self.config.drain_timeout.as_secs(),
            "Draining in-flight runs"
        );
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            match tokio::time::timeout_at(deadline, in_flight.join_next()).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        abandoned = in_flight.len(),
                        "Drain timeout; abandoning in-flight runs"
                    );
                    in_flight.abort_all();
                    break;
                }
            }
        }
    }
}
