// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain enums shared across the workspace.
//!
//! Every enum round-trips through its UPPERCASE (or lowercase, for version
//! metadata) string form used in the database and API payloads.

use serde::{Deserialize, Serialize};

/// Robot id used for system-scope alerts (queue backlog, worker down).
pub const SYSTEM_ROBOT_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Accepted and queued, not yet claimed by a worker.
    Pending,
    /// Claimed by a worker and executing.
    Running,
    /// Child process exited 0.
    Success,
    /// Child failed, timed out, or hit a dispatch-fatal condition.
    Failed,
    /// Canceled cooperatively or forcibly.
    Canceled,
}

impl RunStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// The UPPERCASE string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// Origin of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// A human via the API or portal.
    Manual,
    /// The cron scheduler.
    Scheduled,
    /// A system-created retry follow-up.
    Retry,
}

impl TriggerType {
    /// The UPPERCASE string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Scheduled => "SCHEDULED",
            Self::Retry => "RETRY",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MANUAL" => Ok(Self::Manual),
            "SCHEDULED" => Ok(Self::Scheduled),
            "RETRY" => Ok(Self::Retry),
            _ => Err(format!("Unknown trigger type: {}", s)),
        }
    }
}

/// Deployment environment a run executes against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvName {
    /// Production.
    Prod,
    /// Homologation / staging.
    Hml,
    /// Test.
    Test,
}

impl EnvName {
    /// The UPPERCASE string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prod => "PROD",
            Self::Hml => "HML",
            Self::Test => "TEST",
        }
    }
}

impl std::fmt::Display for EnvName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnvName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PROD" => Ok(Self::Prod),
            "HML" => Ok(Self::Hml),
            "TEST" => Ok(Self::Test),
            _ => Err(format!("env must be one of PROD, HML, TEST; got '{}'", s)),
        }
    }
}

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Heartbeating and claiming runs.
    Running,
    /// Heartbeating but not claiming new runs.
    Paused,
    /// Shut down or soft-deleted by an operator.
    Stopped,
}

impl WorkerStatus {
    /// The UPPERCASE string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "STOPPED" => Ok(Self::Stopped),
            _ => Err(format!("Unknown worker status: {}", s)),
        }
    }
}

/// Severity of a run log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal output (child stdout).
    Info,
    /// Recoverable problems.
    Warn,
    /// Failures (child stderr).
    Error,
}

impl LogLevel {
    /// The UPPERCASE string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an SLA alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    /// The robot missed its expected cadence or daily time.
    Late,
    /// The robot's recent terminal runs are all FAILED.
    FailureStreak,
    /// A worker stopped heartbeating.
    WorkerDown,
    /// The run queue depth crossed the alert threshold.
    QueueBacklog,
}

impl AlertType {
    /// The UPPERCASE string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Late => "LATE",
            Self::FailureStreak => "FAILURE_STREAK",
            Self::WorkerDown => "WORKER_DOWN",
            Self::QueueBacklog => "QUEUE_BACKLOG",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "LATE" => Ok(Self::Late),
            "FAILURE_STREAK" => Ok(Self::FailureStreak),
            "WORKER_DOWN" => Ok(Self::WorkerDown),
            "QUEUE_BACKLOG" => Ok(Self::QueueBacklog),
            _ => Err(format!("Unknown alert type: {}", s)),
        }
    }
}

/// Severity of an alert event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention.
    Warn,
    /// Needs immediate attention.
    Critical,
}

impl AlertSeverity {
    /// The UPPERCASE string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Packaging of a published robot version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Zip archive extracted into a scratch workspace.
    Zip,
    /// Single executable placed into the workspace.
    Exe,
}

impl ArtifactKind {
    /// The lowercase string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Exe => "exe",
        }
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zip" => Ok(Self::Zip),
            "exe" => Ok(Self::Exe),
            _ => Err(format!("Unknown artifact kind: {}", s)),
        }
    }
}

/// How a version's entrypoint is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntrypointKind {
    /// Interpreted script, invoked through the configured interpreter.
    Script,
    /// Native binary, invoked directly.
    Binary,
}

impl EntrypointKind {
    /// The lowercase string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Binary => "binary",
        }
    }
}

impl std::str::FromStr for EntrypointKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "script" => Ok(Self::Script),
            "binary" => Ok(Self::Binary),
            _ => Err(format!("Unknown entrypoint kind: {}", s)),
        }
    }
}

/// Release channel of a published version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Default channel.
    #[default]
    Stable,
    /// Pre-release builds.
    Beta,
    /// Emergency fixes.
    Hotfix,
}

impl Channel {
    /// The lowercase string form stored in the database.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Beta => "beta",
            Self::Hotfix => "hotfix",
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stable" => Ok(Self::Stable),
            "beta" => Ok(Self::Beta),
            "hotfix" => Ok(Self::Hotfix),
            _ => Err(format!("Unknown channel: {}", s)),
        }
    }
}
