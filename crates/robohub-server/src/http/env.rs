// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Env binding surface.
//!
//! Values are stored encrypted. GET returns plaintext only for non-secret
//! rows; secret rows come back redacted (`is_set: true, value: null`).
//! Nothing here ever logs a value.

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use robohub_core::error::CoreError;
use robohub_core::model::EnvName;
use robohub_core::persistence::Store;

use super::{ApiError, ApiResult, AppState, validation_error};

/// `?env=PROD|HML|TEST` selector.
#[derive(Debug, Deserialize)]
pub struct EnvQuery {
    env: String,
}

impl EnvQuery {
    fn parse(&self) -> Result<EnvName, ApiError> {
        self.env
            .parse()
            .map_err(|e: String| validation_error("env", e))
    }
}

/// A binding as returned by the API; secret values are redacted.
#[derive(Debug, Serialize)]
pub struct EnvBindingView {
    pub robot_id: String,
    pub env_name: EnvName,
    pub key: String,
    pub is_secret: bool,
    pub is_set: bool,
    pub value: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `PUT /robots/{robot_id}/env` body.
#[derive(Debug, Deserialize)]
pub struct EnvUpsertRequest {
    pub items: Vec<EnvUpsertItem>,
}

/// One binding in the upsert payload.
#[derive(Debug, Deserialize)]
pub struct EnvUpsertItem {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub is_secret: bool,
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

/// `GET /api/v1/robots/{robot_id}/env?env=`
pub async fn list_env(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    Query(query): Query<EnvQuery>,
) -> ApiResult<Json<Vec<EnvBindingView>>> {
    let env_name = query.parse()?;
    require_robot(&state, &robot_id).await?;

    let bindings = state.store.list_env_bindings(&robot_id, env_name).await?;
    let mut views = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let value = if binding.is_secret {
            None
        } else {
            Some(state.cipher.decrypt(&binding.value)?)
        };
        views.push(EnvBindingView {
            robot_id: binding.robot_id,
            env_name: binding.env_name,
            key: binding.key,
            is_secret: binding.is_secret,
            is_set: true,
            value,
            created_at: binding.created_at,
            updated_at: binding.updated_at,
        });
    }
    Ok(Json(views))
}

/// `PUT /api/v1/robots/{robot_id}/env?env=`
pub async fn upsert_env(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    Query(query): Query<EnvQuery>,
    Json(body): Json<EnvUpsertRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let env_name = query.parse()?;
    require_robot(&state, &robot_id).await?;

    for item in &body.items {
        if item.key.trim().is_empty() {
            return Err(validation_error("key", "key must not be empty"));
        }
    }

    for item in &body.items {
        let ciphertext = state.cipher.encrypt(&item.value);
        state
            .store
            .upsert_env_binding(&robot_id, env_name, &item.key, &ciphertext, item.is_secret)
            .await?;
    }

    tracing::info!(
        robot_id = %robot_id,
        env = %env_name,
        keys = body.items.len(),
        "Env bindings updated"
    );
    Ok(Json(serde_json::json!({"updated": body.items.len()})))
}

/// `DELETE /api/v1/robots/{robot_id}/env/{key}?env=`
pub async fn delete_env(
    State(state): State<AppState>,
    Path((robot_id, key)): Path<(String, String)>,
    Query(query): Query<EnvQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let env_name = query.parse()?;
    require_robot(&state, &robot_id).await?;

    if !state
        .store
        .delete_env_binding(&robot_id, env_name, &key)
        .await?
    {
        return Err(ApiError(CoreError::EnvKeyNotFound { key }));
    }
    Ok(Json(serde_json::json!({"deleted": true})))
}
