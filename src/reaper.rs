use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::store::{Store, now_ms};

/// Background task that periodically releases expired holds and cancels
/// bookings whose payment or approval window has lapsed.
pub async fn run_reaper(store: Arc<Store>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let stats = store.reap_expired(now_ms()).await;
        if stats.holds + stats.bookings > 0 {
            info!(holds = stats.holds, bookings = stats.bookings, "reaper pass");
        }
    }
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<Store>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        debug!(appends, "compacting WAL");
        if let Err(e) = store.compact(now_ms()).await {
            error!("WAL compaction failed: {e}");
        }
    }
}
