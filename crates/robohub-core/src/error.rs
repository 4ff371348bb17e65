// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for robohub-core.
//!
//! Provides a unified error type with stable error codes that the HTTP edge
//! maps onto status codes.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Broad classification used by the HTTP edge to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request, unknown enum value, invalid SemVer or cron.
    Validation,
    /// Unknown robot/version/run/worker/alert.
    NotFound,
    /// Duplicate rows or operations invalid in the current state.
    Conflict,
    /// Operation cannot proceed (no active version, missing env keys).
    Precondition,
    /// Store or infrastructure faults.
    Internal,
}

/// Core errors that can occur during request processing.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Robot was not found.
    RobotNotFound {
        /// The robot ID that was not found.
        robot_id: String,
    },

    /// Robot version was not found (or belongs to another robot).
    VersionNotFound {
        /// The version reference that did not resolve.
        version_ref: String,
    },

    /// Run was not found.
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Worker was not found.
    WorkerNotFound {
        /// The worker ID that was not found.
        worker_id: String,
    },

    /// Schedule was not found for the robot.
    ScheduleNotFound {
        /// The robot ID without a schedule.
        robot_id: String,
    },

    /// SLA rule was not found for the robot.
    SlaRuleNotFound {
        /// The robot ID without an SLA rule.
        robot_id: String,
    },

    /// Alert was not found.
    AlertNotFound {
        /// The alert ID that was not found.
        alert_id: String,
    },

    /// Env binding key was not found.
    EnvKeyNotFound {
        /// The missing key.
        key: String,
    },

    /// Run artifact was not found.
    ArtifactNotFound {
        /// The artifact ID that was not found.
        artifact_id: String,
    },

    /// No version could be resolved for the run.
    NoActiveVersion {
        /// The robot ID with no active version.
        robot_id: String,
    },

    /// Run is in an invalid state for the requested transition.
    InvalidRunState {
        /// The run ID.
        run_id: String,
        /// The expected status.
        expected: String,
        /// The actual status.
        actual: String,
    },

    /// A version with the same (robot, version) pair already exists.
    DuplicateVersion {
        /// The robot ID.
        robot_id: String,
        /// The conflicting version string.
        version: String,
    },

    /// A SCHEDULED run already exists for this (schedule, fire_time) pair.
    DuplicateFire {
        /// The schedule ID.
        schedule_id: String,
        /// The fire time that already produced a run.
        fire_time: String,
    },

    /// The robot already has a schedule.
    ScheduleExists {
        /// The robot ID.
        robot_id: String,
    },

    /// The robot already has an SLA rule.
    SlaRuleExists {
        /// The robot ID.
        robot_id: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// The run's required env keys are not all bound.
    MissingRequiredEnv {
        /// The missing keys, comma separated.
        keys: String,
    },

    /// Encryption or decryption of a secret value failed.
    CipherError {
        /// Reason, never containing plaintext or key material.
        reason: String,
    },

    /// Artifact bytes are missing from the blob store.
    ArtifactBytesMissing {
        /// The sha256 digest that could not be fetched.
        digest: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Filesystem operation failed.
    IoError {
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the stable error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RobotNotFound { .. } => "ROBOT_NOT_FOUND",
            Self::VersionNotFound { .. } => "VERSION_NOT_FOUND",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::WorkerNotFound { .. } => "WORKER_NOT_FOUND",
            Self::ScheduleNotFound { .. } => "SCHEDULE_NOT_FOUND",
            Self::SlaRuleNotFound { .. } => "SLA_RULE_NOT_FOUND",
            Self::AlertNotFound { .. } => "ALERT_NOT_FOUND",
            Self::EnvKeyNotFound { .. } => "ENV_KEY_NOT_FOUND",
            Self::ArtifactNotFound { .. } => "ARTIFACT_NOT_FOUND",
            Self::NoActiveVersion { .. } => "NO_ACTIVE_VERSION",
            Self::InvalidRunState { .. } => "INVALID_RUN_STATE",
            Self::DuplicateVersion { .. } => "DUPLICATE_VERSION",
            Self::DuplicateFire { .. } => "DUPLICATE_FIRE",
            Self::ScheduleExists { .. } => "SCHEDULE_EXISTS",
            Self::SlaRuleExists { .. } => "SLA_RULE_EXISTS",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::MissingRequiredEnv { .. } => "MISSING_REQUIRED_ENV",
            Self::CipherError { .. } => "CIPHER_ERROR",
            Self::ArtifactBytesMissing { .. } => "ARTIFACT_BYTES_MISSING",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::IoError { .. } => "IO_ERROR",
        }
    }

    /// Classify this error for HTTP status mapping.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RobotNotFound { .. }
            | Self::VersionNotFound { .. }
            | Self::RunNotFound { .. }
            | Self::WorkerNotFound { .. }
            | Self::ScheduleNotFound { .. }
            | Self::SlaRuleNotFound { .. }
            | Self::AlertNotFound { .. }
            | Self::EnvKeyNotFound { .. }
            | Self::ArtifactNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidRunState { .. }
            | Self::DuplicateVersion { .. }
            | Self::DuplicateFire { .. }
            | Self::ScheduleExists { .. }
            | Self::SlaRuleExists { .. } => ErrorKind::Conflict,
            Self::NoActiveVersion { .. } | Self::MissingRequiredEnv { .. } => {
                ErrorKind::Precondition
            }
            Self::ValidationError { .. } => ErrorKind::Validation,
            Self::CipherError { .. }
            | Self::ArtifactBytesMissing { .. }
            | Self::DatabaseError { .. }
            | Self::IoError { .. } => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RobotNotFound { robot_id } => write!(f, "Robot '{}' not found", robot_id),
            Self::VersionNotFound { version_ref } => {
                write!(f, "Robot version '{}' not found", version_ref)
            }
            Self::RunNotFound { run_id } => write!(f, "Run '{}' not found", run_id),
            Self::WorkerNotFound { worker_id } => write!(f, "Worker '{}' not found", worker_id),
            Self::ScheduleNotFound { robot_id } => {
                write!(f, "Robot '{}' has no schedule", robot_id)
            }
            Self::SlaRuleNotFound { robot_id } => {
                write!(f, "Robot '{}' has no SLA rule", robot_id)
            }
            Self::AlertNotFound { alert_id } => write!(f, "Alert '{}' not found", alert_id),
            Self::EnvKeyNotFound { key } => write!(f, "Env key '{}' not found", key),
            Self::ArtifactNotFound { artifact_id } => {
                write!(f, "Artifact '{}' not found", artifact_id)
            }
            Self::NoActiveVersion { robot_id } => {
                write!(f, "Robot '{}' has no active version", robot_id)
            }
            Self::InvalidRunState {
                run_id,
                expected,
                actual,
            } => write!(
                f,
                "Run '{}' is in invalid state: expected '{}', got '{}'",
                run_id, expected, actual
            ),
            Self::DuplicateVersion { robot_id, version } => write!(
                f,
                "Robot '{}' already has a version '{}'",
                robot_id, version
            ),
            Self::DuplicateFire {
                schedule_id,
                fire_time,
            } => write!(
                f,
                "Schedule '{}' already fired at '{}'",
                schedule_id, fire_time
            ),
            Self::ScheduleExists { robot_id } => {
                write!(f, "Robot '{}' already has a schedule", robot_id)
            }
            Self::SlaRuleExists { robot_id } => {
                write!(f, "Robot '{}' already has an SLA rule", robot_id)
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::MissingRequiredEnv { keys } => {
                write!(f, "MissingRequiredEnv: {}", keys)
            }
            Self::CipherError { reason } => write!(f, "Cipher error: {}", reason),
            Self::ArtifactBytesMissing { digest } => {
                write!(f, "Artifact bytes missing for digest '{}'", digest)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
            Self::IoError { details } => write!(f, "IO error: {}", details),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IoError {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            CoreError::RobotNotFound {
                robot_id: "x".to_string()
            }
            .error_code(),
            "ROBOT_NOT_FOUND"
        );
        assert_eq!(
            CoreError::NoActiveVersion {
                robot_id: "x".to_string()
            }
            .error_code(),
            "NO_ACTIVE_VERSION"
        );
        assert_eq!(
            CoreError::ValidationError {
                field: "env_name".to_string(),
                message: "bad".to_string()
            }
            .error_code(),
            "VALIDATION_ERROR"
        );
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            CoreError::RunNotFound {
                run_id: "r".to_string()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CoreError::InvalidRunState {
                run_id: "r".to_string(),
                expected: "RUNNING".to_string(),
                actual: "SUCCESS".to_string(),
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            CoreError::MissingRequiredEnv {
                keys: "API_KEY".to_string()
            }
            .kind(),
            ErrorKind::Precondition
        );
    }

    #[test]
    fn test_display_missing_required_env() {
        let err = CoreError::MissingRequiredEnv {
            keys: "API_KEY, DB_URL".to_string(),
        };
        assert_eq!(err.to_string(), "MissingRequiredEnv: API_KEY, DB_URL");
    }
}
