// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron dispatcher loop.
//!
//! Every tick walks each enabled schedule's cron fire times in
//! `(last_tick_at, now]` in the schedule's local timezone and creates one
//! SCHEDULED run per fire. Crash recovery is idempotent: run creation
//! records `(schedule_id, fire_time)` and the unique constraint on that
//! pair swallows re-fires after a restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use robohub_core::clock;
use robohub_core::cron::CronExpr;
use robohub_core::engine::{RunEngine, RunIntent};
use robohub_core::error::CoreError;
use robohub_core::model::TriggerType;
use robohub_core::persistence::{ScheduleRecord, Store};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tick period.
    pub interval: Duration,
    /// Fallback timezone for schedules with unresolvable names.
    pub app_timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            app_timezone: "UTC".to_string(),
        }
    }
}

/// Counters from one scheduler cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerCycleResult {
    /// Runs created this cycle.
    pub dispatched: u64,
    /// Fires suppressed by the schedule window.
    pub skipped_window: u64,
    /// Fires skipped because the schedule was saturated.
    pub skipped_concurrency: u64,
    /// Fires already recorded by a previous cycle (crash recovery).
    pub skipped_duplicate: u64,
}

/// Background loop creating SCHEDULED runs.
pub struct Scheduler {
    engine: Arc<RunEngine>,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Create a new scheduler.
    pub fn new(engine: Arc<RunEngine>, config: SchedulerConfig) -> Self {
        Self {
            engine,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_cycle(clock::now_utc()).await {
                        Ok(result) if result.dispatched > 0 => {
                            info!(
                                dispatched = result.dispatched,
                                skipped_window = result.skipped_window,
                                skipped_concurrency = result.skipped_concurrency,
                                skipped_duplicate = result.skipped_duplicate,
                                "Scheduler cycle complete"
                            );
                        }
                        Ok(_) => debug!("Scheduler cycle complete, nothing due"),
                        Err(e) => error!(error = %e, "Scheduler cycle failed"),
                    }
                }
            }
        }

        info!("Scheduler stopped");
    }

    /// Evaluate every enabled schedule against `now`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<SchedulerCycleResult, CoreError> {
        let mut result = SchedulerCycleResult::default();

        for schedule in self.engine.store().list_enabled_schedules().await? {
            match self.fire_schedule(&schedule, now, &mut result).await {
                Ok(()) => {
                    self.engine
                        .store()
                        .set_schedule_last_tick(&schedule.id, now)
                        .await?;
                }
                Err(e) => {
                    // Leave last_tick_at untouched so the next cycle
                    // retries this schedule's window.
                    warn!(
                        schedule_id = %schedule.id,
                        robot_id = %schedule.robot_id,
                        error = %e,
                        "Schedule evaluation failed"
                    );
                }
            }
        }

        Ok(result)
    }

    async fn fire_schedule(
        &self,
        schedule: &ScheduleRecord,
        now: DateTime<Utc>,
        result: &mut SchedulerCycleResult,
    ) -> Result<(), CoreError> {
        let expr: CronExpr = match schedule.cron_expr.parse() {
            Ok(expr) => expr,
            Err(e) => {
                // A broken expression must not wedge the whole cycle.
                warn!(schedule_id = %schedule.id, error = %e, "Invalid cron expression");
                return Ok(());
            }
        };
        let tz = clock::resolve_timezone(&schedule.timezone, &self.config.app_timezone);

        let last_tick = schedule.last_tick_at.unwrap_or_else(|| {
            let interval = chrono::Duration::from_std(self.config.interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(30));
            schedule.created_at.max(now - interval)
        });

        for fire_time in expr.fire_times(tz, last_tick, now) {
            if !clock::within_window(
                fire_time,
                tz,
                schedule.window_start.as_deref(),
                schedule.window_end.as_deref(),
            )? {
                result.skipped_window += 1;
                continue;
            }

            let active = self
                .engine
                .store()
                .count_active_for_schedule(&schedule.id)
                .await?;
            if active >= schedule.max_concurrency {
                info!(
                    schedule_id = %schedule.id,
                    robot_id = %schedule.robot_id,
                    fire_time = %fire_time,
                    active,
                    "Skipping fire, schedule saturated"
                );
                result.skipped_concurrency += 1;
                continue;
            }

            // Scheduled runs always execute against production.
            let intent = RunIntent {
                trigger_type: TriggerType::Scheduled,
                schedule_id: Some(schedule.id.clone()),
                fire_time: Some(fire_time),
                ..RunIntent::manual(
                    schedule.robot_id.clone(),
                    robohub_core::model::EnvName::Prod,
                )
            };

            match self.engine.create_run(intent).await {
                Ok(run) => {
                    info!(
                        schedule_id = %schedule.id,
                        run_id = %run.run_id,
                        fire_time = %fire_time,
                        "Scheduled run dispatched"
                    );
                    result.dispatched += 1;
                }
                Err(CoreError::DuplicateFire { .. }) => {
                    debug!(
                        schedule_id = %schedule.id,
                        fire_time = %fire_time,
                        "Fire already recorded"
                    );
                    result.skipped_duplicate += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}
