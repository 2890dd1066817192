use super::{Mode, ModeStats, ModeSummary, Target};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Opens `count` greeting connections as fast as the in-flight bound allows.
pub(super) async fn run(target: Arc<Target>, count: u64, cancel: CancellationToken) -> ModeSummary {
    let stats = Arc::new(ModeStats::default());
    let started = Instant::now();
    let tracker = TaskTracker::new();

    for _ in 0..count {
        let permit = tokio::select! {
            permit = Arc::clone(&target.in_flight).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
            _ = cancel.cancelled() => break,
        };

        let target = Arc::clone(&target);
        let stats = Arc::clone(&stats);
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let _permit = permit;
            tokio::select! {
                _ = target.greet(&stats, Mode::Burst) => {}
                _ = cancel.cancelled() => {}
            }
        });
    }

    tracker.close();
    tracker.wait().await;

    let summary = stats.snapshot();
    info!(
        requested = count,
        attempted = summary.attempted,
        failed = summary.failed,
        replies = summary.replies,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Burst complete"
    );
    summary
}
