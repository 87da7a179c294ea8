//! Polling listener: a resync every interval.

use crate::error::SyncResult;
use crate::integration::Integration;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Triggers a resync every `interval` until the integration shuts down.
/// Each tick supersedes a run that is still going.
pub async fn run(integration: Arc<Integration>, interval: Duration, resync_on_start: bool) -> SyncResult<()> {
    let shutdown = integration.shutdown_token();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The first tick completes immediately.
    if !resync_on_start {
        ticker.tick().await;
    }

    info!(interval_secs = interval.as_secs(), resync_on_start, "polling listener started");
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let handle = integration.trigger_resync();
                info!(run_id = %handle.run_id(), "scheduled resync triggered");
            }
        }
    }
    info!("polling listener stopped");
    Ok(())
}
