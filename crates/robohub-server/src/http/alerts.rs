// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Alert surface: list and resolve.

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::Utc;
use serde::Deserialize;

use robohub_core::error::CoreError;
use robohub_core::model::AlertType;
use robohub_core::persistence::{AlertFilter, AlertRecord, Store};

use super::{ApiResult, AppState, validation_error};

/// Query filters for `GET /alerts`.
#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    /// `open` or `resolved`; anything else is everything.
    #[serde(default)]
    status: Option<String>,
    #[serde(default, rename = "type")]
    alert_type: Option<String>,
    #[serde(default)]
    robot_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

/// `GET /api/v1/alerts`
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> ApiResult<Json<Vec<AlertRecord>>> {
    let open = match query.status.as_deref() {
        Some("open") => Some(true),
        Some("resolved") => Some(false),
        _ => None,
    };
    let alert_type = query
        .alert_type
        .as_deref()
        .map(|raw| raw.parse::<AlertType>())
        .transpose()
        .map_err(|e| validation_error("type", e))?;

    let alerts = state
        .store
        .list_alerts(&AlertFilter {
            open,
            alert_type,
            robot_id: query.robot_id,
            limit: query.limit.unwrap_or(200).clamp(1, 1000),
        })
        .await?;
    Ok(Json(alerts))
}

/// `POST /api/v1/alerts/{alert_id}/resolve`
///
/// Resolving an already-resolved alert is a no-op.
pub async fn resolve_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<String>,
) -> ApiResult<Json<AlertRecord>> {
    state
        .store
        .get_alert(&alert_id)
        .await?
        .ok_or_else(|| CoreError::AlertNotFound {
            alert_id: alert_id.clone(),
        })?;
    state.store.resolve_alert(&alert_id, Utc::now()).await?;
    let alert = state
        .store
        .get_alert(&alert_id)
        .await?
        .ok_or(CoreError::AlertNotFound { alert_id })?;
    Ok(Json(alert))
}
