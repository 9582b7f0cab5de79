// Module: http
// Viewer-facing stream endpoints plus the small admin and health surface

pub mod admin;
pub mod error;
pub mod health;
pub mod stream;

use axum::Router;
use ottarr_core::ScheduleStore;
use ottarr_livestream::{ChannelSupervisor, HlsLayout, UpstreamClient};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub schedule: Arc<ScheduleStore>,
    pub supervisor: Arc<ChannelSupervisor>,
    /// Upstream client for passthrough transfers
    pub upstream: UpstreamClient,
    /// Where remuxed output lives; `None` in passthrough mode
    pub hls: Option<HlsLayout>,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoints (for monitoring probes)
        .merge(health::create_health_router())
        // Viewer streams
        .merge(stream::create_stream_router())
        // Session and schedule administration
        .merge(admin::create_admin_router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway on `listener` until `signal` resolves.
///
/// Open transfers only end with their session, so every session is stopped
/// as soon as the signal fires; the server then drains the remaining
/// connections.
pub async fn serve<F>(listener: TcpListener, state: AppState, signal: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let supervisor = Arc::clone(&state.supervisor);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            signal.await;
            info!("Shutdown requested, stopping channel sessions");
            supervisor.shutdown().await;
        })
        .await
}
