// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry surface: version publish (user and CI) and activation.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Multipart, Path, State};
use axum::http::HeaderMap;
use tracing::info;
use uuid::Uuid;

use robohub_core::error::CoreError;
use robohub_core::model::{ArtifactKind, Channel, EntrypointKind};
use robohub_core::persistence::{NewVersion, RobotVersionRecord, Store};

use super::{ApiError, ApiResult, AppState, constant_time_eq, validation_error};

/// Collected multipart fields of a publish request.
#[derive(Default)]
struct PublishForm {
    version: Option<String>,
    channel: Option<String>,
    changelog: Option<String>,
    entrypoint_path: Option<String>,
    entrypoint_type: Option<String>,
    artifact_kind: Option<String>,
    working_dir: Option<String>,
    default_arguments: Option<String>,
    default_env: Option<String>,
    required_env_keys: Option<String>,
    activate: bool,
    commit_sha: Option<String>,
    branch: Option<String>,
    build_url: Option<String>,
    artifact_file_name: Option<String>,
    artifact_bytes: Option<Vec<u8>>,
}

async fn read_publish_form(mut multipart: Multipart) -> Result<PublishForm, ApiError> {
    let mut form = PublishForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| validation_error("multipart", e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "artifact" => {
                form.artifact_file_name = field.file_name().map(|n| n.to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| validation_error("artifact", e.to_string()))?;
                form.artifact_bytes = Some(bytes.to_vec());
            }
            other => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| validation_error(other, e.to_string()))?;
                match other {
                    "version" => form.version = Some(value),
                    "channel" => form.channel = Some(value),
                    "changelog" => form.changelog = Some(value),
                    "entrypoint_path" => form.entrypoint_path = Some(value),
                    "entrypoint_type" => form.entrypoint_type = Some(value),
                    "artifact_kind" => form.artifact_kind = Some(value),
                    "working_dir" => form.working_dir = Some(value),
                    "default_arguments" => form.default_arguments = Some(value),
                    "default_env" => form.default_env = Some(value),
                    "required_env_keys" => form.required_env_keys = Some(value),
                    "activate" => form.activate = matches!(value.as_str(), "true" | "1"),
                    "commit_sha" => form.commit_sha = Some(value),
                    "branch" => form.branch = Some(value),
                    "build_url" => form.build_url = Some(value),
                    _ => {}
                }
            }
        }
    }
    Ok(form)
}

async fn publish(
    state: &AppState,
    robot_id: &str,
    form: PublishForm,
    created_source: &str,
) -> ApiResult<Json<RobotVersionRecord>> {
    let robot = state
        .store
        .get_robot(robot_id)
        .await?
        .ok_or_else(|| CoreError::RobotNotFound {
            robot_id: robot_id.to_string(),
        })?;

    let version = form
        .version
        .ok_or_else(|| validation_error("version", "version is required"))?;
    semver::Version::parse(&version)
        .map_err(|e| validation_error("version", format!("not a valid SemVer: {}", e)))?;

    let channel: Channel = form
        .channel
        .as_deref()
        .unwrap_or("stable")
        .parse()
        .map_err(|e: String| validation_error("channel", e))?;

    let entrypoint_path = form
        .entrypoint_path
        .ok_or_else(|| validation_error("entrypoint_path", "entrypoint_path is required"))?;
    let entrypoint_kind: EntrypointKind = form
        .entrypoint_type
        .as_deref()
        .unwrap_or("script")
        .parse()
        .map_err(|e: String| validation_error("entrypoint_type", e))?;

    let bytes = form
        .artifact_bytes
        .ok_or_else(|| validation_error("artifact", "artifact file is required"))?;
    if bytes.is_empty() {
        return Err(validation_error("artifact", "artifact file is empty"));
    }

    let artifact_kind: ArtifactKind = match form.artifact_kind.as_deref() {
        Some(raw) => raw
            .parse()
            .map_err(|e: String| validation_error("artifact_kind", e))?,
        None => {
            let zip = form
                .artifact_file_name
                .as_deref()
                .map(|n| n.to_lowercase().ends_with(".zip"))
                .unwrap_or(false);
            if zip { ArtifactKind::Zip } else { ArtifactKind::Exe }
        }
    };

    let default_arguments: Vec<String> = parse_json_field("default_arguments", form.default_arguments)?;
    let default_env: HashMap<String, String> = parse_json_field("default_env", form.default_env)?;
    let required_env_keys: Vec<String> = parse_json_field("required_env_keys", form.required_env_keys)?;

    let digest = state.blobstore.put(&bytes).await?;

    let record = state
        .store
        .insert_version(&NewVersion {
            id: Uuid::new_v4().to_string(),
            robot_id: robot.id.clone(),
            version: version.clone(),
            channel,
            artifact_kind,
            artifact_digest: digest,
            entrypoint_kind,
            entrypoint_path,
            default_arguments,
            default_env,
            working_dir: form.working_dir,
            required_env_keys,
            changelog: form.changelog,
            commit_sha: form.commit_sha,
            branch: form.branch,
            build_url: form.build_url,
            created_source: created_source.to_string(),
            is_active: false,
        })
        .await?;

    let record = if form.activate {
        state.store.activate_version(&robot.id, &record.id).await?;
        state
            .store
            .get_version(&record.id)
            .await?
            .unwrap_or(record)
    } else {
        record
    };

    info!(
        robot = %robot.name,
        version = %version,
        source = created_source,
        active = record.is_active,
        size_bytes = bytes.len(),
        "Version published"
    );
    Ok(Json(record))
}

fn parse_json_field<T: serde::de::DeserializeOwned + Default>(
    field: &str,
    raw: Option<String>,
) -> Result<T, ApiError> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
            .map_err(|e| validation_error(field, format!("invalid JSON: {}", e))),
        _ => Ok(T::default()),
    }
}

/// `POST /api/v1/robots/{robot_id}/versions/publish`
pub async fn publish_version(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    multipart: Multipart,
) -> ApiResult<Json<RobotVersionRecord>> {
    let form = read_publish_form(multipart).await?;
    publish(&state, &robot_id, form, "user").await
}

/// `POST /api/v1/deploy/robots/{robot_id}/versions/publish`
///
/// CI route with its own credential; records `created_source = "ci"`.
pub async fn deploy_publish_version(
    State(state): State<AppState>,
    Path(robot_id): Path<String>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult<axum::response::Response> {
    use axum::response::IntoResponse;

    let presented = headers
        .get("x-deploy-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let authorized = state
        .server_config
        .deploy_token
        .as_deref()
        .map(|expected| constant_time_eq(presented, expected))
        .unwrap_or(false);
    if !authorized {
        let body = serde_json::json!({
            "error": { "code": "UNAUTHORIZED", "message": "missing or invalid deploy token" }
        });
        return Ok((axum::http::StatusCode::UNAUTHORIZED, Json(body)).into_response());
    }

    let form = read_publish_form(multipart).await?;
    let record = publish(&state, &robot_id, form, "ci").await?;
    Ok(record.into_response())
}

/// `POST /api/v1/robots/{robot_id}/versions/{version_id}/activate`
pub async fn activate_version(
    State(state): State<AppState>,
    Path((robot_id, version_id)): Path<(String, String)>,
) -> ApiResult<Json<RobotVersionRecord>> {
    state.store.activate_version(&robot_id, &version_id).await?;
    let record = state
        .store
        .get_version(&version_id)
        .await?
        .ok_or(CoreError::VersionNotFound {
            version_ref: version_id,
        })?;
    Ok(Json(record))
}
