// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SLA rule surface: one rule per robot.

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;

use robohub_core::clock;
use robohub_core::error::CoreError;
use robohub_core::persistence::{SlaRuleRecord, SlaRuleSpec, Store};

use super::{ApiError, ApiResult, AppState, validation_error};

/// `POST /robots/{robot_id}/sla` body.
#[derive(Debug, Deserialize)]
pub struct SlaCreateRequest {
    #[serde(default)]
    pub expected_every_minutes: Option<i64>,
    #[serde(default)]
    pub expected_daily_time: Option<String>,
    #[serde(default = "default_late_after")]
    pub late_after_minutes: i64,
    #[serde(default = "default_true")]
    pub alert_on_failure: bool,
    #[serde(default = "default_true")]
    pub alert_on_late: bool,
    #[serde(default)]
    pub notify_channels: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}
fn default_late_after() -> i64 {
    15
}

/// `PATCH /robots/{robot_id}/sla` body: partial update.
#[derive(Debug, Default, Deserialize)]
pub struct SlaUpdateRequest {
    #[serde(default)]
    pub expected_every_minutes: Option<i64>,
    #[serde(default)]
    pub expected_daily_time: Option<String>,
    #[serde(default)]
    pub late_after_minutes: Option<i64>,
    #[serde(default)]
    pub alert_on_failure: Option<bool>,
    #[serde(default)]
    pub alert_on_late: Option<bool>,
    #[serde(default)]
    pub notify_channels: Option<serde_json::Value>,
}

fn validate_spec(spec: &SlaRuleSpec) -> Result<(), ApiError> {
    if spec.expected_every_minutes.is_none() && spec.expected_daily_time.is_none() {
        return Err(validation_error(
            "sla",
            "provide expected_every_minutes or expected_daily_time",
        ));
    }
    if let Some(minutes) = spec.expected_every_minutes {
        if minutes < 1 {
            return Err(validation_error("expected_every_minutes", "must be >= 1"));
        }
    }
    if let Some(daily) = &spec.expected_daily_time {
        clock::parse_hhmm(daily).map_err(ApiError)?;
    }
    if spec.late_after_minutes < 1 {
        return Err(validation_error("late_after_minutes", "must be >= 1"));
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

/// `POST /api/v1/robots/{robot_id}/sla`
pub async fn create_sla_rule(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    Json(body): Json<SlaCreateRequest>,
) -> ApiResult<Json<SlaRuleRecord>> {
    require_robot(&state, &robot_id).await?;
    let spec = SlaRuleSpec {
        expected_every_minutes: body.expected_every_minutes,
        expected_daily_time: body.expected_daily_time,
        late_after_minutes: body.late_after_minutes,
        alert_on_failure: body.alert_on_failure,
        alert_on_late: body.alert_on_late,
        notify_channels: body.notify_channels.unwrap_or(serde_json::json!({})),
    };
    validate_spec(&spec)?;
    Ok(Json(state.store.create_sla_rule(&robot_id, &spec).await?))
}

/// `GET /api/v1/robots/{robot_id}/sla`
pub async fn get_sla_rule(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
) -> ApiResult<Json<SlaRuleRecord>> {
    require_robot(&state, &robot_id).await?;
    let rule = state
        .store
        .get_sla_rule(&robot_id)
        .await?
        .ok_or(CoreError::SlaRuleNotFound { robot_id })?;
    Ok(Json(rule))
}

/// `PATCH /api/v1/robots/{robot_id}/sla`
pub async fn update_sla_rule(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    Json(body): Json<SlaUpdateRequest>,
) -> ApiResult<Json<SlaRuleRecord>> {
    let existing = state
        .store
        .get_sla_rule(&robot_id)
        .await?
        .ok_or_else(|| CoreError::SlaRuleNotFound {
            robot_id: robot_id.clone(),
        })?;

    let spec = SlaRuleSpec {
        expected_every_minutes: body
            .expected_every_minutes
            .or(existing.expected_every_minutes),
        expected_daily_time: body
            .expected_daily_time
            .or(existing.expected_daily_time),
        late_after_minutes: body.late_after_minutes.unwrap_or(existing.late_after_minutes),
        alert_on_failure: body.alert_on_failure.unwrap_or(existing.alert_on_failure),
        alert_on_late: body.alert_on_late.unwrap_or(existing.alert_on_late),
        notify_channels: match body.notify_channels {
            Some(channels) => channels,
            None => serde_json::from_str(&existing.notify_channels)
                .unwrap_or(serde_json::json!({})),
        },
    };
    validate_spec(&spec)?;
    Ok(Json(state.store.update_sla_rule(&robot_id, &spec).await?))
}
