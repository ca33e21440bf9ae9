//! Periodic reclamation sweeps.

use std::sync::Arc;
use std::time::Duration;

use rangeload_transfer::TransferEngine;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Runs [`TransferEngine::trigger_reclamation`] on a fixed interval until
/// stopped.
pub struct ReclamationTicker {
    engine: Arc<TransferEngine>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl ReclamationTicker {
    pub fn new(engine: Arc<TransferEngine>) -> Self {
        Self {
            engine,
            cancel: Mutex::new(None),
        }
    }

    /// Starts sweeping every `interval`, replacing any running loop. The
    /// first sweep happens one interval after the start.
    pub async fn start(&self, interval: Duration) {
        let mut cancel_slot = self.cancel.lock().await;
        if let Some(cancel) = cancel_slot.take() {
            cancel.cancel();
        }

        let cancel = CancellationToken::new();
        *cancel_slot = Some(cancel.clone());

        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            sweep_loop(engine, interval, cancel).await;
        });

        tracing::info!(interval_secs = interval.as_secs(), "reclamation ticker started");
    }

    pub async fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().await.take() {
            cancel.cancel();
            tracing::info!("reclamation ticker stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.cancel.lock().await.is_some()
    }
}

async fn sweep_loop(engine: Arc<TransferEngine>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the first immediate tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = engine.trigger_reclamation().await;
                tracing::debug!(
                    persisted = report.persisted.len(),
                    discarded = report.discarded.len(),
                    evicted = report.evicted.len(),
                    failed = report.failed.len(),
                    "reclamation tick"
                );
            }
        }
    }
}
