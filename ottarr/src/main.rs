mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use ottarr_core::{
    bootstrap::load_config,
    config::DeliveryMode,
    logging, ScheduleSource, ScheduleStore,
};
use ottarr_livestream::{
    ChannelSupervisor, DeliveryPipeline, PassthroughPipeline, RemuxPipeline, RemuxSettings,
    SupervisorConfig, UpstreamClient, UpstreamSettings,
};

use server::OttarrServer;

#[derive(Parser, Debug)]
#[command(name = "ottarr")]
#[command(about = "Schedule-driven virtual sports channels", long_about = None)]
struct Args {
    /// Path to a YAML or TOML config file
    #[arg(long, env = "OTTARR_CONFIG_PATH")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("ottarr starting...");
    info!("HTTP address: {}", config.http_address());
    info!("Delivery mode: {}", config.streaming.delivery);

    // 3. Schedule: initial load is best effort, the reload task keeps trying
    let schedule = Arc::new(ScheduleStore::new(ScheduleSource::parse(
        &config.schedule.source,
    ))?);
    schedule.load_initial().await;
    let reload_task = schedule.start_reload_task(config.schedule.reload_interval());

    // 4. Delivery pipeline for the configured mode
    let (pipeline, hls) = match config.streaming.delivery {
        DeliveryMode::Passthrough => (
            Arc::new(PassthroughPipeline) as Arc<dyn DeliveryPipeline>,
            None,
        ),
        DeliveryMode::Remux => {
            let remux = RemuxPipeline::new(RemuxSettings::from_config(
                &config.remux,
                &config.streaming,
            ));
            let layout = remux.layout().clone();
            info!("Remux output directory: {}", layout.root().display());
            (Arc::new(remux) as Arc<dyn DeliveryPipeline>, Some(layout))
        }
    };

    // 5. Channel supervisor
    let supervisor = Arc::new(ChannelSupervisor::new(
        Arc::clone(&schedule),
        pipeline,
        SupervisorConfig::from(&config),
    ));

    let upstream = UpstreamClient::new(UpstreamSettings::from(&config.streaming))?;

    // 6. Serve until SIGINT/SIGTERM, then stop every session
    let server = OttarrServer::new(config, schedule, supervisor, upstream, hls);
    let result = server.run().await;

    reload_task.abort();
    info!("ottarr stopped");
    result
}
