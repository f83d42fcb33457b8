use std::collections::HashMap;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use shared::protocol::IGNORE_VIEW_ID;
use shared::types::DeviceView;
use crate::context::Context;

/// Set on icon responses when the client should draw the default image
pub const DEFAULT_ICON_HEADER: &str = "x-default-icon";

#[derive(Clone)]
pub struct AppState {
    pub ctx: Context,
}

#[derive(Deserialize)]
pub struct DeviceQuery {
    pub service_name: Option<String>,
}

#[derive(Deserialize)]
pub struct IconQuery {
    pub view_id: Option<i32>,
    #[serde(default)]
    pub notification: bool,
}

#[derive(Serialize)]
pub struct IconStatus {
    pub using_default_image: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/devices", get(get_devices))
        .route("/v1/devices/:id", get(get_device))
        .route("/v1/devices/:id/about", get(get_about))
        .route("/v1/devices/:id/icon", get(get_icon))
        .route("/v1/devices/:id/icon/status", get(get_icon_status))
        .route("/v1/devices/:id/tags/:key", get(get_tag).put(put_tag).delete(delete_tag))
        .with_state(state)
}

async fn get_devices(
    State(state): State<AppState>,
    Query(params): Query<DeviceQuery>,
) -> Json<Vec<DeviceView>> {
    let devices = match params.service_name {
        Some(name) => state.ctx.registry.by_service_name(&name).into_iter().collect(),
        None => state.ctx.registry.devices(),
    };

    let mut devices: Vec<DeviceView> = devices.iter().map(|d| d.view()).collect();
    devices.sort_by(|a, b| a.friendly_name.cmp(&b.friendly_name));
    Json(devices)
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<DeviceView>, StatusCode> {
    state
        .ctx
        .registry
        .get(id)
        .map(|d| Json(d.view()))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_about(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<HashMap<String, String>>, StatusCode> {
    state
        .ctx
        .registry
        .read_about(id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_icon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<IconQuery>,
) -> Response {
    if !state.ctx.registry.contains(id) {
        return StatusCode::NOT_FOUND.into_response();
    }

    let view_id = query.view_id.unwrap_or(IGNORE_VIEW_ID);
    let Some(path) = state.ctx.device_image(id, query.notification, view_id) else {
        return (StatusCode::NOT_FOUND, [(DEFAULT_ICON_HEADER, "true")]).into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(e) => {
            tracing::error!("Failed to read icon {}: {}", path.display(), e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_icon_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<IconStatus>, StatusCode> {
    if !state.ctx.registry.contains(id) {
        return Err(StatusCode::NOT_FOUND);
    }

    state
        .ctx
        .is_using_default_image(id)
        .await
        .map(|using_default_image| Json(IconStatus { using_default_image }))
        .map_err(|e| {
            tracing::error!("Failed to query icon status: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_tag(
    State(state): State<AppState>,
    Path((id, key)): Path<(Uuid, String)>,
) -> Result<String, StatusCode> {
    state.ctx.registry.tag(id, &key).ok_or(StatusCode::NOT_FOUND)
}

async fn put_tag(
    State(state): State<AppState>,
    Path((id, key)): Path<(Uuid, String)>,
    value: String,
) -> StatusCode {
    if !state.ctx.registry.contains(id) {
        return StatusCode::NOT_FOUND;
    }
    state.ctx.registry.set_tag(id, &key, &value);
    StatusCode::NO_CONTENT
}

async fn delete_tag(
    State(state): State<AppState>,
    Path((id, key)): Path<(Uuid, String)>,
) -> StatusCode {
    if !state.ctx.registry.contains(id) {
        return StatusCode::NOT_FOUND;
    }
    state.ctx.registry.remove_tag(id, &key);
    StatusCode::NO_CONTENT
}
