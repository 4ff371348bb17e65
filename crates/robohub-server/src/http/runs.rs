// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run surface: execute, list, inspect, cancel, artifact download.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use robohub_core::engine::RunIntent;
use robohub_core::error::CoreError;
use robohub_core::model::{EnvName, RunStatus, TriggerType};
use robohub_core::persistence::{RunFilter, RunLogRecord, RunRecord, Store};

use super::{ApiError, ApiResult, AppState, principal_from_headers, validation_error};

/// `POST /runs/{robot_id}/execute` body.
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    /// Explicit version to run; None selects the robot's active version.
    #[serde(default)]
    pub version_id: Option<String>,
    /// Alias of `version_id` kept for older clients.
    #[serde(default)]
    pub robot_version_id: Option<String>,
    #[serde(default)]
    pub runtime_arguments: Vec<String>,
    #[serde(default)]
    pub runtime_env: HashMap<String, String>,
    pub env_name: String,
}

impl ExecuteRequest {
    /// Resolve the two version aliases; both present and unequal is an
    /// error.
    fn version_ref(&self) -> Result<Option<String>, ApiError> {
        match (&self.version_id, &self.robot_version_id) {
            (Some(a), Some(b)) if a != b => Err(validation_error(
                "version_id",
                "version_id and robot_version_id disagree",
            )),
            (Some(a), _) => Ok(Some(a.clone())),
            (None, b) => Ok(b.clone()),
        }
    }
}

/// `POST /api/v1/runs/{robot_id}/execute`
pub async fn execute(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExecuteRequest>,
) -> ApiResult<Json<RunRecord>> {
    let env_name: EnvName = body
        .env_name
        .parse()
        .map_err(|e: String| validation_error("env_name", e))?;
    let version_id = body.version_ref()?;

    let run = state
        .engine
        .create_run(RunIntent {
            version_id,
            runtime_arguments: body.runtime_arguments,
            runtime_env: body.runtime_env,
            triggered_by: principal_from_headers(&headers),
            ..RunIntent::manual(robot_id, env_name)
        })
        .await?;
    Ok(Json(run))
}

/// Query filters for `GET /api/v1/runs`.
#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    #[serde(default)]
    robot_id: Option<String>,
    #[serde(default)]
    service_id: Option<String>,
    #[serde(default)]
    trigger_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

/// `GET /api/v1/runs`
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Vec<RunRecord>>> {
    let trigger_type = query
        .trigger_type
        .as_deref()
        .map(|raw| raw.parse::<TriggerType>())
        .transpose()
        .map_err(|e| validation_error("trigger_type", e))?;
    let status = query
        .status
        .as_deref()
        .map(|raw| raw.parse::<RunStatus>())
        .transpose()
        .map_err(|e| validation_error("status", e))?;

    let runs = state
        .store
        .list_runs(&RunFilter {
            robot_id: query.robot_id,
            service_id: query.service_id,
            trigger_type,
            status,
            limit: query.limit.unwrap_or(50).clamp(1, 500),
            offset: query.offset.unwrap_or(0).max(0),
        })
        .await?;
    Ok(Json(runs))
}

/// `GET /api/v1/runs/{run_id}`
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunRecord>> {
    Ok(Json(state.engine.require_run(&run_id).await?))
}

/// Query for `GET /api/v1/runs/{run_id}/logs`.
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    /// Return lines with sequence strictly greater than this.
    #[serde(default)]
    after_seq: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

/// `GET /api/v1/runs/{run_id}/logs`
pub async fn get_run_logs(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<RunLogRecord>>> {
    let logs = state
        .engine
        .get_logs_since(
            &run_id,
            query.after_seq.unwrap_or(-1),
            query.limit.unwrap_or(500).clamp(1, 5000),
        )
        .await?;
    Ok(Json(logs))
}

/// `POST /api/v1/runs/{run_id}/cancel`
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<RunRecord>> {
    let run = state
        .engine
        .request_cancel(&run_id, principal_from_headers(&headers).as_deref())
        .await?;
    Ok(Json(run))
}

/// `GET /api/v1/runs/{run_id}/artifacts/{artifact_id}/download`
pub async fn download_artifact(
    State(state): State<AppState>,
    Path((run_id, artifact_id)): Path<(String, String)>,
) -> ApiResult<Response> {
    let artifact = state
        .store
        .get_artifact(&artifact_id)
        .await?
        .filter(|a| a.run_id == run_id)
        .ok_or(CoreError::ArtifactNotFound {
            artifact_id: artifact_id.clone(),
        })?;

    let bytes = tokio::fs::read(&artifact.path)
        .await
        .map_err(|_| CoreError::ArtifactNotFound {
            artifact_id: artifact_id.clone(),
        })?;

    let content_type = artifact
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    let response = axum::http::Response::builder()
        .header(axum::http::header::CONTENT_TYPE, content_type)
        .header(
            axum::http::header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", artifact.name),
        )
        .body(axum::body::Body::from(bytes))
        .map_err(|e| CoreError::IoError {
            details: e.to_string(),
        })?;
    Ok(response.into_response())
}
