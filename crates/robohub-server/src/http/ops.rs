// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations status surface.

use axum::Json;
use axum::extract::State;
use chrono::{Duration, Utc};
use serde::Serialize;

use robohub_core::model::RunStatus;
use robohub_core::persistence::Store;

use super::{ApiResult, AppState};

/// `GET /ops/status` payload.
#[derive(Debug, Serialize)]
pub struct OpsStatus {
    pub total_workers: i64,
    pub workers_running: i64,
    pub workers_paused: i64,
    pub queue_depth: i64,
    pub runs_running: i64,
    pub runs_failed_last_hour: i64,
    pub uptime_seconds: u64,
}

/// `GET /api/v1/ops/status`
pub async fn status(State(state): State<AppState>) -> ApiResult<Json<OpsStatus>> {
    let now = Utc::now();
    let workers = state.store.count_workers().await?;
    let queue_depth = state.engine.queue().depth(now).await?;
    let runs_running = state.store.count_runs_with_status(RunStatus::Running).await?;
    let runs_failed_last_hour = state
        .store
        .count_failed_since(now - Duration::hours(1))
        .await?;

    Ok(Json(OpsStatus {
        total_workers: workers.total,
        workers_running: workers.running,
        workers_paused: workers.paused,
        queue_depth,
        runs_running,
        runs_failed_last_hour,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    }))
}
