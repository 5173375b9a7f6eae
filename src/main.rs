//! Synchronized multi-camera capture with an interactive trigger prompt

use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use synccap::sim::SimFleet;
use synccap::{stdin_lines, Orchestrator, RawFileWriter, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("synccap=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("synccap launching...");

    // Load configuration
    let settings = Settings::load()?;

    // No vendor transport is linked in; drive the simulated fleet
    warn!(
        cameras = settings.simulator.cameras,
        "Using simulated camera fleet"
    );
    let (cameras, transport) = SimFleet::new(&settings.simulator).into_parts();

    let mut orchestrator = Orchestrator::new(cameras, Box::new(transport), settings)?;
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let report = orchestrator
        .run(RawFileWriter, stdin_lines()?, interrupt)
        .await?;

    if let Some(report) = report {
        info!(
            "Saved {} frames to session {} ({} failed)",
            report.persisted, report.session, report.failed
        );
    }
    info!("synccap shutting down");
    Ok(())
}
