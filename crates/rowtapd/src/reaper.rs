//! Reaper - background task that closes idle cached connectors.

use rowtap_connectors::ConnectorStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::metrics::DaemonMetrics;

/// Spawn reaper as a background tokio task.
pub fn spawn_reaper(
    store: Arc<ConnectorStore>,
    metrics: DaemonMetrics,
    idle_ttl: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            reap_idle(&store, &metrics, idle_ttl).await;
        }
    })
}

/// One eviction pass. Returns how many connectors were closed.
pub async fn reap_idle(store: &ConnectorStore, metrics: &DaemonMetrics, idle_ttl: Duration) -> usize {
    let evicted = store.evict_idle(idle_ttl).await;
    if evicted > 0 {
        info!("Reaper closed {} idle connector(s)", evicted);
        metrics.connectors_evicted.inc_by(evicted as u64);
    } else {
        debug!("Reaper found no idle connectors");
    }
    metrics.set_cached_connectors(store.len());
    evicted
}
