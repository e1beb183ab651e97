//! Periodic background refresh
//!
//! Admin mutations refresh the pool synchronously, but keys can also be
//! edited directly in the database by other tooling. This task rescans the
//! store on a fixed interval so those edits reach the rotation without a
//! restart.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::Pool;

/// Spawn a task that calls `Pool::refresh` every `interval` until `shutdown`
/// is cancelled.
///
/// A failed scan is logged and retried on the next tick; the pool keeps
/// serving its previous key list in the meantime.
pub fn spawn_refresh_task(
    pool: Arc<Pool>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate first tick: the pool was just loaded
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("key refresh task stopped");
                    return;
                }
                _ = ticker.tick() => refresh_cycle(&pool).await,
            }
        }
    })
}

async fn refresh_cycle(pool: &Pool) {
    match pool.refresh().await {
        Ok(keys) => debug!(keys, "periodic key refresh"),
        Err(e) => warn!(error = %e, "periodic key refresh failed, will retry next cycle"),
    }
}
