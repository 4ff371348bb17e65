// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Schedule surface: one cron schedule per robot.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;

use robohub_core::clock;
use robohub_core::cron::CronExpr;
use robohub_core::error::CoreError;
use robohub_core::persistence::{ScheduleRecord, ScheduleSpec, Store};

use super::{ApiError, ApiResult, AppState, validation_error};

/// `POST /robots/{robot_id}/schedule` body.
#[derive(Debug, Deserialize)]
pub struct ScheduleCreateRequest {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub cron_expr: String,
    pub timezone: String,
    #[serde(default)]
    pub window_start: Option<String>,
    #[serde(default)]
    pub window_end: Option<String>,
    #[serde(default = "default_one")]
    pub max_concurrency: i64,
    #[serde(default = "default_timeout")]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub retry_count: i64,
    #[serde(default = "default_backoff")]
    pub retry_backoff_seconds: i64,
}

fn default_true() -> bool {
    true
}
fn default_one() -> i64 {
    1
}
fn default_timeout() -> i64 {
    3600
}
fn default_backoff() -> i64 {
    60
}

/// `PATCH /robots/{robot_id}/schedule` body: partial update.
#[derive(Debug, Default, Deserialize)]
pub struct ScheduleUpdateRequest {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub cron_expr: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default, with = "double_option")]
    pub window_start: Option<Option<String>>,
    #[serde(default, with = "double_option")]
    pub window_end: Option<Option<String>>,
    #[serde(default)]
    pub max_concurrency: Option<i64>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub retry_count: Option<i64>,
    #[serde(default)]
    pub retry_backoff_seconds: Option<i64>,
}

/// Distinguishes an absent field from an explicit null (clear window).
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

fn validate_spec(spec: &ScheduleSpec) -> Result<(), ApiError> {
    spec.cron_expr.parse::<CronExpr>().map_err(ApiError)?;
    if spec.timezone.parse::<chrono_tz::Tz>().is_err() {
        return Err(validation_error(
            "timezone",
            format!("'{}' is not a known IANA timezone", spec.timezone),
        ));
    }
    if spec.window_start.is_some() != spec.window_end.is_some() {
        return Err(validation_error(
            "window",
            "window_start and window_end must be set together",
        ));
    }
    for bound in [&spec.window_start, &spec.window_end].into_iter().flatten() {
        clock::parse_hhmm(bound).map_err(ApiError)?;
    }
    if spec.max_concurrency < 1 {
        return Err(validation_error("max_concurrency", "must be >= 1"));
    }
    if spec.timeout_seconds < 1 {
        return Err(validation_error("timeout_seconds", "must be >= 1"));
    }
    if spec.retry_count < 0 {
        return Err(validation_error("retry_count", "must be >= 0"));
    }
    if spec.retry_backoff_seconds < 1 {
        return Err(validation_error("retry_backoff_seconds", "must be >= 1"));
    }
    Ok(())
}

async fn require_robot(state: &AppState, robot_id: &str) -> Result<(), ApiError> {
    state
        .store
        .get_robot(robot_id)
        .await?
        .map(|_| ())
        .ok_or_else(|| {
            ApiError(CoreError::RobotNotFound {
                robot_id: robot_id.to_string(),
            })
        })
}

/// `POST /api/v1/robots/{robot_id}/schedule`
pub async fn create_schedule(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    Json(body): Json<ScheduleCreateRequest>,
) -> ApiResult<Json<ScheduleRecord>> {
    require_robot(&state, &robot_id).await?;
    let spec = ScheduleSpec {
        enabled: body.enabled,
        cron_expr: body.cron_expr,
        timezone: body.timezone,
        window_start: body.window_start,
        window_end: body.window_end,
        max_concurrency: body.max_concurrency,
        timeout_seconds: body.timeout_seconds,
        retry_count: body.retry_count,
        retry_backoff_seconds: body.retry_backoff_seconds,
    };
    validate_spec(&spec)?;
    Ok(Json(state.store.create_schedule(&robot_id, &spec).await?))
}

/// `GET /api/v1/robots/{robot_id}/schedule`
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
) -> ApiResult<Json<ScheduleRecord>> {
    require_robot(&state, &robot_id).await?;
    let schedule = state
        .store
        .get_schedule(&robot_id)
        .await?
        .ok_or(CoreError::ScheduleNotFound { robot_id })?;
    Ok(Json(schedule))
}

/// `PATCH /api/v1/robots/{robot_id}/schedule`
pub async fn update_schedule(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    Json(body): Json<ScheduleUpdateRequest>,
) -> ApiResult<Json<ScheduleRecord>> {
    let existing = state
        .store
        .get_schedule(&robot_id)
        .await?
        .ok_or_else(|| CoreError::ScheduleNotFound {
            robot_id: robot_id.clone(),
        })?;

    let spec = ScheduleSpec {
        enabled: body.enabled.unwrap_or(existing.enabled),
        cron_expr: body.cron_expr.unwrap_or(existing.cron_expr),
        timezone: body.timezone.unwrap_or(existing.timezone),
        window_start: body.window_start.unwrap_or(existing.window_start),
        window_end: body.window_end.unwrap_or(existing.window_end),
        max_concurrency: body.max_concurrency.unwrap_or(existing.max_concurrency),
        timeout_seconds: body.timeout_seconds.unwrap_or(existing.timeout_seconds),
        retry_count: body.retry_count.unwrap_or(existing.retry_count),
        retry_backoff_seconds: body
            .retry_backoff_seconds
            .unwrap_or(existing.retry_backoff_seconds),
    };
    validate_spec(&spec)?;
    Ok(Json(state.store.update_schedule(&robot_id, &spec).await?))
}

/// `DELETE /api/v1/robots/{robot_id}/schedule`
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.store.delete_schedule(&robot_id).await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}
