// Admin endpoints: session status, administrative stop, schedule reload

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use ottarr_livestream::SessionStatus;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::http::{AppError, AppResult, AppState};

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub channel_id: String,
    pub stopped: bool,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub channels: usize,
}

pub fn create_admin_router() -> Router<AppState> {
    Router::new()
        .route("/streams/status", get(stream_status))
        .route("/streams/stop/{channel_id}", post(stop_stream))
        .route("/schedule/reload", post(reload_schedule))
}

/// GET /streams/status
async fn stream_status(State(state): State<AppState>) -> Json<BTreeMap<String, SessionStatus>> {
    Json(state.supervisor.status())
}

/// POST /streams/stop/{channel_id}
async fn stop_stream(
    Path(channel_id): Path<String>,
    State(state): State<AppState>,
) -> AppResult<Json<StopResponse>> {
    if !state.supervisor.stop(&channel_id).await {
        return Err(AppError::not_found("No session for channel"));
    }
    info!(channel_id = %channel_id, "Session stopped by administrator");
    Ok(Json(StopResponse {
        channel_id,
        stopped: true,
    }))
}

/// POST /schedule/reload
///
/// On failure the previous schedule stays in effect.
async fn reload_schedule(State(state): State<AppState>) -> AppResult<Json<ReloadResponse>> {
    match state.schedule.reload().await {
        Ok(channels) => {
            info!(channels, "Schedule reloaded on request");
            Ok(Json(ReloadResponse { channels }))
        }
        Err(e) => {
            error!("Schedule reload failed: {}", e);
            Err(AppError::bad_gateway("Schedule reload failed"))
        }
    }
}
