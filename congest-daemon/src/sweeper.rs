//! Background sweeper for congestion entries.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::debug;

use congest_core::SharedCongestionService;

/// Spawns a background Tokio task that periodically revalidates entries
/// against the current rules and releases idle ones.
///
/// Each tick also drains operations that were queued behind busy partitions.
pub fn spawn_sweeper(service: SharedCongestionService, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);

        // Prevent immediately ticking when spawned
        interval.tick().await;

        loop {
            interval.tick().await;

            let report = service.sweep(service.now());
            if report.removed > 0 || report.rebound > 0 {
                debug!(
                    removed = report.removed,
                    rebound = report.rebound,
                    deferred = report.deferred,
                    "congestion sweep"
                );
            }
        }
    })
}
