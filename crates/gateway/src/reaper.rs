use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use common::Courier;

/// Purge up to `batch` expired allocations in one transaction.
pub async fn reap_expired(courier: &Courier, batch: usize) -> common::Result<usize> {
    let mut tx = courier.begin().await?;
    let expired = courier
        .allocations()
        .retrieve_oldest_expired(tx.as_mut(), Utc::now(), batch)
        .await?;
    for allocation in &expired {
        courier
            .allocations()
            .clear_allocation(tx.as_mut(), allocation.id)
            .await?;
    }
    tx.commit().await?;
    Ok(expired.len())
}

/// Run [`reap_expired`] every `interval` until shutdown.
pub async fn run(
    courier: Courier,
    interval: Duration,
    batch: usize,
    mut shutdown_rx: watch::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match reap_expired(&courier, batch).await {
                    Ok(0) => {}
                    Ok(purged) => tracing::info!("reaper purged {} expired allocations", purged),
                    Err(e) => tracing::error!("reaper run failed: {}", e),
                }
            }
            _ = shutdown_rx.changed() => {
                tracing::info!("reaper shutting down");
                break;
            }
        }
    }
}
