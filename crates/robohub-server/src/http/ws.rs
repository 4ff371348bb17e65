// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WebSocket log streaming.
//!
//! A subscriber first receives the run's full log history in sequence
//! order, then live lines with no gaps or duplicates; the log bus handles
//! the handover. Frames are JSON:
//! `{"id", "run_id", "timestamp", "level", "message"}`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use futures_util::SinkExt;
use tracing::{debug, info};

use robohub_core::persistence::RunLogRecord;

use super::{ApiError, AppState};

/// `GET /api/v1/ws/runs/{run_id}/logs?token=`
pub async fn run_log_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Response {
    // 404 before the upgrade when the run is unknown.
    if let Err(e) = state.engine.require_run(&run_id).await {
        return ApiError(e).into_response();
    }
    ws.on_upgrade(move |socket| stream_logs(socket, state, run_id))
}

async fn stream_logs(mut socket: WebSocket, state: AppState, run_id: String) {
    info!(run_id = %run_id, "Log stream subscriber connected");

    let mut rx = match state.engine.logbus().subscribe(&run_id).await {
        Ok(rx) => rx,
        Err(e) => {
            debug!(run_id = %run_id, error = %e, "Subscription failed");
            let _ = socket.close().await;
            return;
        }
    };

    let mut sent = 0u64;
    loop {
        tokio::select! {
            record = rx.recv() => {
                let Some(record) = record else {
                    break;
                };
                if send_frame(&mut socket, &record).await.is_err() {
                    break;
                }
                sent += 1;
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(run_id = %run_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    state.engine.logbus().prune(&run_id).await;
    info!(run_id = %run_id, lines = sent, "Log stream subscriber disconnected");
}

async fn send_frame(socket: &mut WebSocket, record: &RunLogRecord) -> Result<(), ()> {
    let frame = serde_json::json!({
        "id": record.id,
        "run_id": record.run_id,
        "timestamp": record.timestamp,
        "level": record.level,
        "message": record.message,
    });
    socket
        .send(Message::Text(frame.to_string().into()))
        .await
        .map_err(|_| ())
}
