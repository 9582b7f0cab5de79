//! Viewer stream endpoints
//!
//! Endpoints:
//! - GET /stream/{channel}            - live channel (extension optional)
//! - GET /stream/{channel}.ts         - passthrough transport stream
//! - GET /stream/{channel}.m3u8       - remuxed HLS playlist
//! - GET /stream/{channel}/{segment}  - remuxed HLS segment
//!
//! What `/stream/{channel}` returns depends on the server's delivery mode.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use chrono::Utc;
use ottarr_core::config::DeliveryMode;
use ottarr_core::resolver;
use ottarr_livestream::protocols::hls::{self, HlsLayout};
use ottarr_livestream::protocols::passthrough;
use ottarr_livestream::{SessionLease, SessionState, StreamError};
use tracing::{debug, info};

use crate::http::{AppError, AppResult, AppState};

const STREAM_EXTENSIONS: [&str; 3] = [".ts", ".m3u8", ".m3u"];
const TS_CONTENT_TYPE: &str = "video/mp2t";
const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Headers mirrored from a ranged upstream response, besides Content-Type
const MIRRORED_RANGE_HEADERS: [HeaderName; 3] = [
    header::CONTENT_RANGE,
    header::CONTENT_LENGTH,
    header::ACCEPT_RANGES,
];

pub fn create_stream_router() -> Router<AppState> {
    Router::new()
        .route("/stream/{channel}", get(handle_stream))
        .route("/stream/{channel}/{segment}", get(handle_segment))
}

/// Channel id with any stream extension removed
fn strip_extension(raw: &str) -> &str {
    STREAM_EXTENSIONS
        .iter()
        .find_map(|ext| raw.strip_suffix(ext))
        .filter(|id| !id.is_empty())
        .unwrap_or(raw)
}

fn live_response(status: StatusCode, content_type: HeaderValue) -> axum::http::response::Builder {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::EXPIRES, "0")
        .header("X-Content-Type-Options", "nosniff")
        .header("X-Accel-Buffering", "no")
}

/// GET /stream/{channel}
async fn handle_stream(
    Path(raw): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let channel_id = strip_extension(&raw);
    if !state.schedule.snapshot().contains(channel_id) {
        return Err(AppError::not_found("Channel not found"));
    }

    match state.supervisor.pipeline().mode() {
        DeliveryMode::Passthrough => passthrough_stream(&state, channel_id, &headers).await,
        DeliveryMode::Remux => remux_playlist(&state, channel_id).await,
    }
}

/// Lease the channel's session. An off-air channel names its next program.
async fn lease_channel(state: &AppState, channel_id: &str) -> AppResult<SessionLease> {
    match state.supervisor.lease(channel_id).await {
        Ok(lease) => Ok(lease),
        Err(StreamError::NoActiveProgram(_)) => Err(off_air(state, channel_id)),
        Err(e) => Err(e.into()),
    }
}

fn off_air(state: &AppState, channel_id: &str) -> AppError {
    let snapshot = state.schedule.snapshot();
    let upcoming = snapshot
        .channel(channel_id)
        .and_then(|channel| resolver::next(channel, Utc::now()));
    match upcoming {
        Some(program) => AppError::not_found(format!(
            "No program currently scheduled; next: {} at {}",
            program.name,
            program.start.to_rfc3339()
        )),
        None => AppError::not_found("No program currently scheduled"),
    }
}

async fn passthrough_stream(
    state: &AppState,
    channel_id: &str,
    headers: &HeaderMap,
) -> AppResult<Response> {
    let lease = lease_channel(state, channel_id).await?;
    let source_url = lease.session().source_url();
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());

    info!(
        channel_id = %channel_id,
        source_url = %source_url,
        range = ?range,
        "Passthrough stream request"
    );

    let upstream = state.upstream.open(&source_url, range).await?;
    let status = upstream.status();

    if range.is_some()
        && (status == StatusCode::PARTIAL_CONTENT || status == StatusCode::RANGE_NOT_SATISFIABLE)
    {
        let content_type = upstream
            .headers()
            .get(header::CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(TS_CONTENT_TYPE));
        let mut builder = live_response(status, content_type);
        for name in MIRRORED_RANGE_HEADERS {
            if let Some(value) = upstream.headers().get(&name) {
                builder = builder.header(name, value.clone());
            }
        }
        debug!(channel_id = %channel_id, %status, "Mirroring ranged upstream response");
        return builder
            .body(Body::from_stream(passthrough::raw_stream(lease, upstream)))
            .map_err(|_| AppError::internal_server_error("Failed to build response"));
    }

    let body = Body::from_stream(passthrough::aligned_stream(
        state.upstream.clone(),
        lease,
        upstream,
    ));
    live_response(StatusCode::OK, HeaderValue::from_static(TS_CONTENT_TYPE))
        .header(header::ACCEPT_RANGES, "none")
        .body(body)
        .map_err(|_| AppError::internal_server_error("Failed to build response"))
}

async fn remux_playlist(state: &AppState, channel_id: &str) -> AppResult<Response> {
    let layout = remux_layout(state)?;
    let lease = lease_channel(state, channel_id).await?;
    if lease.session().state() == SessionState::Starting {
        return Err(StreamError::SessionStarting(channel_id.to_string()).into());
    }

    let manifest = match tokio::fs::read_to_string(layout.manifest_path(channel_id)).await {
        Ok(manifest) => manifest,
        // between runs during a switch
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StreamError::SessionStarting(channel_id.to_string()).into());
        }
        Err(e) => return Err(e.into()),
    };

    // relative, so it resolves under /stream/ from both /stream/{id} and /stream/{id}.m3u8
    let body = hls::rewrite_manifest(&manifest, &hls::uri_component(channel_id));
    live_response(StatusCode::OK, HeaderValue::from_static(PLAYLIST_CONTENT_TYPE))
        .body(Body::from(body))
        .map_err(|_| AppError::internal_server_error("Failed to build response"))
}

/// GET /stream/{channel}/{segment}
async fn handle_segment(
    Path((channel_id, segment)): Path<(String, String)>,
    State(state): State<AppState>,
) -> AppResult<Response> {
    let layout = remux_layout(&state)?;
    let path = layout
        .segment_path(&channel_id, &segment)
        .ok_or_else(|| AppError::not_found("Segment not found"))?;

    if !state.supervisor.touch(&channel_id) {
        return Err(AppError::not_found("No session for channel"));
    }

    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(AppError::not_found("Segment not found"));
        }
        Err(e) => return Err(e.into()),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, segment_content_type(&segment))
        .header(header::CACHE_CONTROL, "public, max-age=60")
        .body(Body::from(data))
        .map_err(|_| AppError::internal_server_error("Failed to build response"))
}

fn remux_layout(state: &AppState) -> AppResult<&HlsLayout> {
    state
        .hls
        .as_ref()
        .ok_or_else(|| AppError::not_found("HLS output not enabled"))
}

fn segment_content_type(segment: &str) -> &'static str {
    match segment.rsplit('.').next() {
        Some("mp4" | "m4s") => "video/mp4",
        Some("aac") => "audio/aac",
        _ => TS_CONTENT_TYPE,
    }
}
