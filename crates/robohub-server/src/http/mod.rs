// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP/WS surface for the hub.
//!
//! All routes live under `/api/v1` and require the bearer token, except
//! `GET /health` and the CI deploy route (which carries its own
//! `x-deploy-token` credential). WebSocket clients authenticate with a
//! `?token=` query parameter.

mod alerts;
mod env;
mod ops;
mod registry;
mod runs;
mod schedules;
mod sla;
mod workers;
mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, extract::State};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use robohub_core::blobstore::BlobStore;
use robohub_core::cipher::Cipher;
use robohub_core::config::CoreConfig;
use robohub_core::engine::RunEngine;
use robohub_core::error::{CoreError, ErrorKind};
use robohub_core::persistence::Store;

use crate::config::ServerConfig;

/// Request body cap; robot artifacts dominate (CI uploads zips).
const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The run lifecycle engine.
    pub engine: Arc<RunEngine>,
    /// Direct store access for read paths and registry writes.
    pub store: Arc<dyn Store>,
    /// Envelope cipher for env bindings.
    pub cipher: Cipher,
    /// Artifact byte store.
    pub blobstore: BlobStore,
    /// Core tunables.
    pub core_config: CoreConfig,
    /// Server tunables.
    pub server_config: ServerConfig,
    /// Process start, for the ops uptime counter.
    pub started_at: Instant,
}

/// Error wrapper mapping `CoreError` onto HTTP responses.
pub struct ApiError(
    /// The underlying core error.
    pub CoreError,
);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Precondition => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = self.0.error_code(), error = %self.0, "Request failed");
        }
        let body = serde_json::json!({
            "error": {
                "code": self.0.error_code(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Handler result alias.
pub type ApiResult<T> = Result<T, ApiError>;

/// Shorthand for a 400 validation error.
pub fn validation_error(field: &str, message: impl Into<String>) -> ApiError {
    ApiError(CoreError::ValidationError {
        field: field.to_string(),
        message: message.into(),
    })
}

/// Constant-time string comparison for token checks.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// The user the edge authenticated, forwarded in a trusted header.
pub fn principal_from_headers(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get("x-robohub-user")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .filter(|v| !v.is_empty())
}

/// Bearer/`?token=` auth middleware for the protected API routes.
async fn require_api_token(
    State(state): State<AppState>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let Some(expected) = &state.server_config.api_token else {
        // No token configured: open instance (development).
        return next.run(req).await;
    };

    let from_header = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if constant_time_eq(from_header, expected) {
        return next.run(req).await;
    }

    // WebSocket clients cannot set headers; accept ?token= instead.
    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if constant_time_eq(token, expected) {
                    return next.run(req).await;
                }
            }
        }
    }

    let body = serde_json::json!({
        "error": { "code": "UNAUTHORIZED", "message": "missing or invalid token" }
    });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    match state.store.health_check().await {
        Ok(true) => Json(serde_json::json!({"status": "ok"})).into_response(),
        _ => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "degraded"})),
        )
            .into_response(),
    }
}

/// Build the hub router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        // `{id}` is a robot id for execute and a run id everywhere else;
        // the router needs one name per segment position.
        .route("/api/v1/runs", get(runs::list_runs))
        .route("/api/v1/runs/{id}/execute", post(runs::execute))
        .route("/api/v1/runs/{id}", get(runs::get_run))
        .route("/api/v1/runs/{id}/logs", get(runs::get_run_logs))
        .route("/api/v1/runs/{id}/cancel", post(runs::cancel_run))
        .route(
            "/api/v1/runs/{id}/artifacts/{artifact_id}/download",
            get(runs::download_artifact),
        )
        .route("/api/v1/ws/runs/{run_id}/logs", get(ws::run_log_stream))
        .route(
            "/api/v1/robots/{robot_id}/versions/publish",
            post(registry::publish_version),
        )
        .route(
            "/api/v1/robots/{robot_id}/versions/{version_id}/activate",
            post(registry::activate_version),
        )
        .route(
            "/api/v1/robots/{robot_id}/schedule",
            post(schedules::create_schedule)
                .get(schedules::get_schedule)
                .patch(schedules::update_schedule)
                .delete(schedules::delete_schedule),
        )
        .route(
            "/api/v1/robots/{robot_id}/sla",
            post(sla::create_sla_rule)
                .get(sla::get_sla_rule)
                .patch(sla::update_sla_rule),
        )
        .route(
            "/api/v1/robots/{robot_id}/env",
            get(env::list_env).put(env::upsert_env),
        )
        .route("/api/v1/robots/{robot_id}/env/{key}", axum::routing::delete(env::delete_env))
        .route("/api/v1/workers", get(workers::list_workers))
        .route("/api/v1/workers/{worker_id}/pause", post(workers::pause_worker))
        .route("/api/v1/workers/{worker_id}/resume", post(workers::resume_worker))
        .route("/api/v1/ops/status", get(ops::status))
        .route("/api/v1/alerts", get(alerts::list_alerts))
        .route("/api/v1/alerts/{alert_id}/resolve", post(alerts::resolve_alert))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_api_token,
        ));

    // The deploy route authenticates with its own credential; /health is
    // open for probes.
    let public = Router::new()
        .route("/health", get(health))
        .route(
            "/api/v1/deploy/robots/{robot_id}/versions/publish",
            post(registry::deploy_publish_version),
        );

    protected
        .merge(public)
        .layer(
            CorsLayer::new()
                .allow_methods(Any)
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
