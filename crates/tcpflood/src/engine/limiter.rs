use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Connection allowance derived from a target rate.
///
/// The cumulative target `floor(hertz * elapsed)` is recomputed from the
/// budget origin on every call and only the difference to what was already
/// issued is granted. Fractional permits therefore carry over between slices
/// and every whole second aligned to the origin yields exactly `hertz`
/// permits, however the second is sliced.
#[derive(Debug, Clone)]
pub struct RateBudget {
    hertz: u64,
    issued: u64,
}

impl RateBudget {
    pub fn new(hertz: u64) -> Self {
        Self { hertz, issued: 0 }
    }

    pub fn hertz(&self) -> u64 {
        self.hertz
    }

    pub fn issued(&self) -> u64 {
        self.issued
    }

    /// Permits that became available by `elapsed` since the origin and have
    /// not been granted yet.
    pub fn allowance(&mut self, elapsed: Duration) -> u64 {
        let target = (self.hertz as u128 * elapsed.as_nanos() / NANOS_PER_SEC) as u64;
        let grant = target.saturating_sub(self.issued);
        self.issued += grant;
        grant
    }
}

/// Paces load-mode connection issuance.
///
/// Time is cut into slices. At the start of every slice the limiter grants
/// the permits the slice's end is entitled to, so a second's allowance is
/// spread over its slices instead of being spent at the boundary. A rate of
/// zero means unbounded: every call grants one permit after yielding to the
/// scheduler.
pub struct ConnectionRateLimiter {
    pacing: Option<Pacing>,
}

struct Pacing {
    budget: RateBudget,
    origin: Instant,
    slice: Duration,
    interval: Interval,
}

impl ConnectionRateLimiter {
    pub fn new(hertz: u64, slice: Duration) -> Self {
        Self::starting_at(hertz, slice, Instant::now())
    }

    pub fn starting_at(hertz: u64, slice: Duration, origin: Instant) -> Self {
        if hertz == 0 {
            return Self { pacing: None };
        }

        let slice = slice.max(Duration::from_millis(1));
        let mut interval = interval_at(origin, slice);
        // Skipped slices are not lost: the next grant is computed from the
        // cumulative target and includes them.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            pacing: Some(Pacing {
                budget: RateBudget::new(hertz),
                origin,
                slice,
                interval,
            }),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.pacing.is_none()
    }

    pub fn issued(&self) -> Option<u64> {
        self.pacing.as_ref().map(|p| p.budget.issued())
    }

    /// Waits for the next slice with a non-empty allowance and returns it.
    ///
    /// Cancel safe: dropping the future before it resolves loses no permits.
    pub async fn acquire(&mut self) -> u64 {
        let Some(pacing) = self.pacing.as_mut() else {
            tokio::task::yield_now().await;
            return 1;
        };

        loop {
            let slice_start = pacing.interval.tick().await;
            let slice_end = slice_start.saturating_duration_since(pacing.origin) + pacing.slice;
            let permits = pacing.budget.allowance(slice_end);
            if permits > 0 {
                debug!(
                    permits,
                    issued = pacing.budget.issued(),
                    "Rate limiter granted slice"
                );
                return permits;
            }
        }
    }
}
