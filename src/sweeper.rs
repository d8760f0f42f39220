use std::sync::Arc;
use std::time::Duration;

use crate::engine::{now_ms, Engine};

/// How often the compactor looks at the append counter.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that marks overdue borrows and requests.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match engine.sweep_overdue(now_ms()).await {
            Ok(outcome) if !outcome.is_empty() => {
                tracing::debug!(
                    "sweep marked rows {:?}, requests {:?}",
                    outcome.overdue_rows,
                    outcome.overdue_requests
                );
            }
            Ok(_) => {}
            // A failed sweep leaves the rest for the next tick.
            Err(e) => tracing::error!("overdue sweep failed: {e}"),
        }
        engine.notify.prune();
    }
}

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        tracing::debug!("{appends} appends since last compaction");
        match engine.compact_wal().await {
            Ok(true) => {}
            Ok(false) => tracing::debug!("compaction deferred"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
