//! Idle-session reaper.
//!
//! Runs alongside live traffic on a fixed cadence; each sweep closes every
//! session whose idle time exceeds the configured timeout, so an expired
//! session is gone no later than one interval after expiry.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

use super::PoolManager;

/// Run sweeps until the shutdown watch flips. Spawned once at startup.
pub async fn run(pool: Arc<PoolManager>, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(pool.config().reap_interval_secs);
    let mut ticker = tokio::time::interval(interval);
    // The immediate first tick would sweep an empty pool.
    ticker.tick().await;

    info!(interval_secs = interval.as_secs(), "reaper started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaped = pool.reap_expired().await;
                if !reaped.is_empty() {
                    info!(count = reaped.len(), "reaper sweep closed sessions");
                } else {
                    debug!("reaper sweep — nothing expired");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("reaper stopped");
                    return;
                }
            }
        }
    }
}
