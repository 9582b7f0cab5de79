//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use ottarr_core::{resolver, Schedule};
use serde::Serialize;

use crate::http::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub total_channels: usize,
    pub active_sessions: usize,
    /// Soonest program that has not started yet, across all channels
    pub next_program: Option<UpcomingProgram>,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct UpcomingProgram {
    pub channel_id: String,
    pub name: String,
    pub start: DateTime<Utc>,
}

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// Always healthy while the server runs; reports schedule and session counts
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.schedule.snapshot();
    let now = Utc::now();
    Json(HealthResponse {
        status: "healthy",
        total_channels: snapshot.len(),
        active_sessions: state.supervisor.active_count(),
        next_program: upcoming(&snapshot, now),
        timestamp: now.to_rfc3339(),
    })
}

fn upcoming(schedule: &Schedule, now: DateTime<Utc>) -> Option<UpcomingProgram> {
    schedule
        .channels()
        .filter_map(|channel| resolver::next(channel, now).map(|program| (channel, program)))
        .min_by_key(|(_, program)| program.start)
        .map(|(channel, program)| UpcomingProgram {
            channel_id: channel.id.clone(),
            name: program.name.clone(),
            start: program.start,
        })
}
