//! Rangeload daemon entry point.

mod app;
mod config;
mod ticker;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting rangeload daemon"
    );

    let config = config::Config::load()?;
    tracing::info!(
        staleness_secs = config.staleness_window_secs,
        sweep_secs = config.sweep_interval_secs,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("daemon shut down cleanly");
    Ok(())
}
