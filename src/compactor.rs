use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::notify::NotifyHub;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Background task that compacts the WAL once enough appends have piled up,
/// and drops notice channels nobody listens to any more.
pub async fn run_compactor(engine: Arc<Engine>, hub: Arc<NotifyHub>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        hub.prune();
        compact_if_due(&engine, threshold).await;
    }
}

/// Compact when at least `threshold` appends have landed since the last
/// compaction. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor: {appends} appends since last compaction, threshold {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compactor: compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("compactor: compaction failed: {e}");
            false
        }
    }
}
