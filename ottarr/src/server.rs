//! Server lifecycle management
//!
//! Runs the HTTP gateway and, on shutdown, stops every channel session so
//! that no managed process outlives the server.

use std::sync::Arc;
use tracing::{error, info};

use ottarr_api::{serve, AppState};
use ottarr_core::{Config, ScheduleStore};
use ottarr_livestream::{ChannelSupervisor, HlsLayout, UpstreamClient};

/// `ottarr` server - owns the gateway and the supervisor
pub struct OttarrServer {
    config: Config,
    schedule: Arc<ScheduleStore>,
    supervisor: Arc<ChannelSupervisor>,
    upstream: UpstreamClient,
    hls: Option<HlsLayout>,
}

impl OttarrServer {
    pub const fn new(
        config: Config,
        schedule: Arc<ScheduleStore>,
        supervisor: Arc<ChannelSupervisor>,
        upstream: UpstreamClient,
        hls: Option<HlsLayout>,
    ) -> Self {
        Self {
            config,
            schedule,
            supervisor,
            upstream,
            hls,
        }
    }

    /// Serve HTTP until a shutdown signal arrives.
    pub async fn run(self) -> anyhow::Result<()> {
        let http_addr = self.config.http_address();
        let state = AppState {
            schedule: self.schedule,
            supervisor: Arc::clone(&self.supervisor),
            upstream: self.upstream,
            hls: self.hls,
        };

        let listener = tokio::net::TcpListener::bind(&http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        // sessions are stopped when the signal fires, before connections drain
        let served = serve(listener, state, shutdown_signal()).await;
        if let Err(e) = &served {
            error!("HTTP server error: {}", e);
        }
        info!("HTTP server shut down gracefully");

        // catches sessions started by requests that were still draining
        self.supervisor.shutdown().await;
        info!("All channel sessions stopped");

        served.map_err(Into::into)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
