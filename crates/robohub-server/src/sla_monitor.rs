// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SLA evaluation loop.
//!
//! Every tick compares recent run history, queue depth and worker
//! heartbeats against the per-robot SLA rules and opens or auto-resolves
//! alert events. At most one alert is open per `(robot, type)` at any
//! time; the store's partial unique index enforces it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use robohub_core::clock;
use robohub_core::engine::RunEngine;
use robohub_core::error::CoreError;
use robohub_core::model::{
    AlertSeverity, AlertType, RunStatus, SYSTEM_ROBOT_ID, WorkerStatus,
};
use robohub_core::persistence::{SlaRuleRecord, Store};

/// SLA monitor configuration.
#[derive(Debug, Clone)]
pub struct SlaMonitorConfig {
    /// Tick period.
    pub interval: Duration,
    /// Fallback timezone for daily-time rules.
    pub app_timezone: String,
    /// Queue depth at which a QUEUE_BACKLOG alert opens.
    pub queue_backlog_threshold: i64,
    /// Seconds without a heartbeat before a worker is stale.
    pub worker_stale_seconds: i64,
    /// Consecutive FAILED terminal runs that open a FAILURE_STREAK alert.
    pub failure_streak_threshold: i64,
}

impl Default for SlaMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            app_timezone: "UTC".to_string(),
            queue_backlog_threshold: 50,
            worker_stale_seconds: 180,
            failure_streak_threshold: 3,
        }
    }
}

/// Counters from one SLA cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlaCycleResult {
    /// Rules evaluated.
    pub checked_rules: u64,
    /// Alerts opened this cycle.
    pub opened: u64,
    /// Alerts auto-resolved this cycle.
    pub resolved: u64,
}

/// Background loop producing and resolving alert events.
pub struct SlaMonitor {
    engine: Arc<RunEngine>,
    config: SlaMonitorConfig,
    shutdown: Arc<Notify>,
}

impl SlaMonitor {
    /// Create a new SLA monitor.
    pub fn new(engine: Arc<RunEngine>, config: SlaMonitorConfig) -> Self {
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

    /// Run the SLA monitor loop until shutdown.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            failure_streak_threshold = self.config.failure_streak_threshold,
            "SLA monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("SLA monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    match self.run_cycle(clock::now_utc()).await {
                        Ok(result) if result.opened > 0 || result.resolved > 0 => {
                            info!(
                                checked_rules = result.checked_rules,
                                opened = result.opened,
                                resolved = result.resolved,
                                "SLA cycle complete"
                            );
                        }
                        Ok(result) => debug!(checked_rules = result.checked_rules, "SLA cycle complete"),
                        Err(e) => error!(error = %e, "SLA cycle failed"),
                    }
                }
            }
        }

        info!("SLA monitor stopped");
    }

    /// Evaluate all rules plus the global worker/backlog conditions.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<SlaCycleResult, CoreError> {
        let mut result = SlaCycleResult::default();

        for rule in self.engine.store().list_sla_rules().await? {
            result.checked_rules += 1;
            if let Err(e) = self.evaluate_rule(&rule, now, &mut result).await {
                warn!(robot_id = %rule.robot_id, error = %e, "SLA rule evaluation failed");
            }
        }

        self.evaluate_worker_down(now, &mut result).await?;
        self.evaluate_queue_backlog(now, &mut result).await?;

        Ok(result)
    }

    async fn evaluate_rule(
        &self,
        rule: &SlaRuleRecord,
        now: DateTime<Utc>,
        result: &mut SlaCycleResult,
    ) -> Result<(), CoreError> {
        if rule.alert_on_late {
            let late = self.is_late(rule, now).await?;
            if late {
                let metadata = serde_json::json!({
                    "expected_every_minutes": rule.expected_every_minutes,
                    "expected_daily_time": rule.expected_daily_time,
                    "late_after_minutes": rule.late_after_minutes,
                });
                self.open(
                    &rule.robot_id,
                    AlertType::Late,
                    AlertSeverity::Warn,
                    &format!("Robot {} missed its SLA deadline", rule.robot_id),
                    &metadata,
                    now,
                    result,
                )
                .await?;
            } else {
                self.resolve(&rule.robot_id, AlertType::Late, now, result)
                    .await?;
            }
        }

        if rule.alert_on_failure {
            let streaking = self.has_failure_streak(&rule.robot_id).await?;
            if streaking {
                let metadata = serde_json::json!({
                    "failure_streak_threshold": self.config.failure_streak_threshold,
                });
                self.open(
                    &rule.robot_id,
                    AlertType::FailureStreak,
                    AlertSeverity::Critical,
                    &format!(
                        "Robot {} failed {} consecutive runs",
                        rule.robot_id, self.config.failure_streak_threshold
                    ),
                    &metadata,
                    now,
                    result,
                )
                .await?;
            } else {
                self.resolve(&rule.robot_id, AlertType::FailureStreak, now, result)
                    .await?;
            }
        }

        Ok(())
    }

    /// Lateness against either the cadence or the daily-time form.
    async fn is_late(&self, rule: &SlaRuleRecord, now: DateTime<Utc>) -> Result<bool, CoreError> {
        if let Some(expected_every) = rule.expected_every_minutes {
            let last_success = self
                .engine
                .store()
                .last_success_for_robot(&rule.robot_id)
                .await?;
            // A robot with no success yet is measured from rule creation,
            // so a freshly configured SLA does not alert instantly.
            let baseline = last_success
                .and_then(|r| r.finished_at)
                .unwrap_or(rule.created_at);
            let allowance = ChronoDuration::minutes(expected_every + rule.late_after_minutes);
            return Ok(now - baseline > allowance);
        }

        if let Some(daily) = &rule.expected_daily_time {
            let tz = self.robot_timezone(&rule.robot_id).await?;
            let target = clock::parse_hhmm(daily)?;
            let local_now = now.with_timezone(&tz);
            let expected_local = local_now.date_naive().and_time(target);
            let Some(expected) = chrono::TimeZone::from_local_datetime(&tz, &expected_local)
                .earliest()
            else {
                return Ok(false);
            };
            let deadline = expected + ChronoDuration::minutes(rule.late_after_minutes);
            if now <= deadline {
                return Ok(false);
            }
            let successes = self
                .engine
                .store()
                .count_success_since(&rule.robot_id, expected.with_timezone(&Utc))
                .await?;
            return Ok(successes == 0);
        }

        Ok(false)
    }

    /// The robot's schedule timezone, falling back to the app default.
    async fn robot_timezone(&self, robot_id: &str) -> Result<chrono_tz::Tz, CoreError> {
        let name = self
            .engine
            .store()
            .get_schedule(robot_id)
            .await?
            .map(|s| s.timezone)
            .unwrap_or_else(|| self.config.app_timezone.clone());
        Ok(clock::resolve_timezone(&name, &self.config.app_timezone))
    }

    /// Whether the last N terminal runs are all FAILED.
    async fn has_failure_streak(&self, robot_id: &str) -> Result<bool, CoreError> {
        let threshold = self.config.failure_streak_threshold;
        if threshold <= 0 {
            return Ok(false);
        }
        let recent = self
            .engine
            .store()
            .list_recent_terminal_runs(robot_id, threshold)
            .await?;
        Ok(recent.len() == threshold as usize
            && recent.iter().all(|r| r.status == RunStatus::Failed))
    }

    /// WORKER_DOWN is a system-scope alert keyed to the sentinel robot,
    /// with the stale worker list as evidence.
    async fn evaluate_worker_down(
        &self,
        now: DateTime<Utc>,
        result: &mut SlaCycleResult,
    ) -> Result<(), CoreError> {
        let stale_after = ChronoDuration::seconds(self.config.worker_stale_seconds);
        let stale: Vec<String> = self
            .engine
            .store()
            .list_workers()
            .await?
            .into_iter()
            .filter(|w| w.status != WorkerStatus::Stopped && now - w.last_heartbeat > stale_after)
            .map(|w| w.worker_id)
            .collect();

        if stale.is_empty() {
            self.resolve(SYSTEM_ROBOT_ID, AlertType::WorkerDown, now, result)
                .await
        } else {
            let metadata = serde_json::json!({
                "stale_workers": stale,
                "stale_after_seconds": self.config.worker_stale_seconds,
            });
            self.open(
                SYSTEM_ROBOT_ID,
                AlertType::WorkerDown,
                AlertSeverity::Critical,
                "Worker heartbeat is stale",
                &metadata,
                now,
                result,
            )
            .await
        }
    }

    async fn evaluate_queue_backlog(
        &self,
        now: DateTime<Utc>,
        result: &mut SlaCycleResult,
    ) -> Result<(), CoreError> {
        let depth = self.engine.queue().depth(now).await?;
        if depth >= self.config.queue_backlog_threshold {
            let metadata = serde_json::json!({
                "queue_depth": depth,
                "threshold": self.config.queue_backlog_threshold,
            });
            self.open(
                SYSTEM_ROBOT_ID,
                AlertType::QueueBacklog,
                AlertSeverity::Warn,
                &format!("Queue depth is high ({})", depth),
                &metadata,
                now,
                result,
            )
            .await
        } else {
            self.resolve(SYSTEM_ROBOT_ID, AlertType::QueueBacklog, now, result)
                .await
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn open(
        &self,
        robot_id: &str,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: &str,
        metadata: &serde_json::Value,
        _now: DateTime<Utc>,
        result: &mut SlaCycleResult,
    ) -> Result<(), CoreError> {
        if let Some(alert) = self
            .engine
            .store()
            .open_alert(robot_id, None, alert_type, severity, message, metadata)
            .await?
        {
            warn!(
                alert_id = %alert.id,
                robot_id = %robot_id,
                alert_type = %alert_type,
                severity = %severity,
                "Alert opened"
            );
            result.opened += 1;
        }
        Ok(())
    }

    async fn resolve(
        &self,
        robot_id: &str,
        alert_type: AlertType,
        now: DateTime<Utc>,
        result: &mut SlaCycleResult,
    ) -> Result<(), CoreError> {
        if self
            .engine
            .store()
            .resolve_open_alert(robot_id, alert_type, now)
            .await?
        {
            info!(robot_id = %robot_id, alert_type = %alert_type, "Alert auto-resolved");
            result.resolved += 1;
        }
        Ok(())
    }
}
