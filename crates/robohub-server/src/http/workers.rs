// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker fleet surface: list, pause, resume.

use axum::Json;
use axum::extract::{Path, State};

use robohub_core::error::CoreError;
use robohub_core::model::WorkerStatus;
use robohub_core::persistence::{Store, WorkerRecord};

use super::{ApiResult, AppState};

/// `GET /api/v1/workers`
pub async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkerRecord>>> {
    Ok(Json(state.store.list_workers().await?))
}

async fn set_status(
    state: &AppState,
    worker_id: String,
    status: WorkerStatus,
) -> ApiResult<Json<WorkerRecord>> {
    if !state.store.set_worker_status(&worker_id, status).await? {
        return Err(CoreError::WorkerNotFound { worker_id }.into());
    }
    let worker = state
        .store
        .get_worker(&worker_id)
        .await?
        .ok_or(CoreError::WorkerNotFound { worker_id })?;
    tracing::info!(worker_id = %worker.worker_id, status = %worker.status, "Worker status changed");
    Ok(Json(worker))
}

/// `POST /api/v1/workers/{worker_id}/pause`
///
/// Paused workers stop claiming; in-flight runs continue to completion.
pub async fn pause_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<WorkerRecord>> {
    set_status(&state, worker_id, WorkerStatus::Paused).await
}

/// `POST /api/v1/workers/{worker_id}/resume`
pub async fn resume_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> ApiResult<Json<WorkerRecord>> {
    set_status(&state, worker_id, WorkerStatus::Running).await
}
