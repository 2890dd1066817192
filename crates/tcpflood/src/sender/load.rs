use super::{Mode, ModeStats, ModeSummary, Target};
use crate::engine::epoch::{report_epochs, EpochClock, EpochCounter};
use crate::engine::limiter::ConnectionRateLimiter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

/// Issues greeting connections at `hertz` per second until cancelled.
///
/// Cancellation is checked before every slice and while waiting for
/// permits. In-flight connections share the token, so they close promptly
/// and are awaited before the summary is returned.
pub(super) async fn run(target: Arc<Target>, hertz: u64, cancel: CancellationToken) -> ModeSummary {
    let stats = Arc::new(ModeStats::default());
    let clock = EpochClock::start();
    let issued = Arc::new(EpochCounter::new(clock));
    let mut limiter =
        ConnectionRateLimiter::starting_at(hertz, target.config.slice(), clock.origin());
    let tracker = TaskTracker::new();

    let reporter = Arc::clone(&issued);
    let reporter_cancel = cancel.clone();
    tracker.spawn(async move {
        report_epochs(&reporter, "issued", reporter_cancel, |_| {}).await;
    });

    'issue: loop {
        if cancel.is_cancelled() {
            break;
        }

        let permits = tokio::select! {
            n = limiter.acquire() => n,
            _ = cancel.cancelled() => break,
        };

        for _ in 0..permits {
            let permit = tokio::select! {
                permit = Arc::clone(&target.in_flight).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break 'issue,
                },
                _ = cancel.cancelled() => break 'issue,
            };

            issued.record();
            let target = Arc::clone(&target);
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            tracker.spawn(async move {
                let _permit = permit;
                tokio::select! {
                    _ = target.greet(&stats, Mode::Load) => {}
                    _ = cancel.cancelled() => {}
                }
            });
        }
    }

    tracker.close();
    tracker.wait().await;

    let summary = stats.snapshot();
    info!(
        hertz,
        attempted = summary.attempted,
        failed = summary.failed,
        replies = summary.replies,
        "Load stopped"
    );
    summary
}
