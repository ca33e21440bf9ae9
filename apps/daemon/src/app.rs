//! Wires the transfer engine and its background sweep together.

use std::sync::Arc;

use rangeload_transfer::TransferEngine;

use crate::config::Config;
use crate::ticker::ReclamationTicker;

/// Runs the daemon until ctrl-c.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let engine = Arc::new(TransferEngine::open(config.engine_config()).await?);

    let ticker = ReclamationTicker::new(Arc::clone(&engine));
    match config.sweep_interval() {
        Some(interval) => ticker.start(interval).await,
        None => tracing::warn!("sweep interval is 0, stalled transfers will not be reclaimed"),
    }

    tracing::info!(data_dir = %config.data_dir.display(), "daemon ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("SIGINT received, shutting down");

    ticker.stop().await;
    Ok(())
}
