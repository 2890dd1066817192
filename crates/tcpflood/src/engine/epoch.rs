//! One-second accounting windows shared by the listener and the sender's
//! load mode.
//!
//! An [`EpochClock`] maps instants onto epoch numbers measured from a fixed
//! origin. An [`EpochCounter`] tallies connections per epoch and keeps only
//! the current and the most recently reported epochs, so it never grows
//! with the length of a run.
//!
//! Greeting replies are rationed per epoch in acceptance order. Every
//! connection admitted with [`EpochCounter::admit`] holds an [`Admission`]
//! carrying its position in the epoch. A greeting is answered only if fewer
//! than `cap` connections accepted before it in the same epoch were
//! greetings, so it waits until each earlier connection has been classified
//! (or the cap is known to be spent). The admission keeps its epoch's slots
//! alive, so pruning a reported epoch never revokes a pending reply.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const EPOCH_LENGTH: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn next(self) -> Epoch {
        Epoch(self.0 + 1)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EpochClock {
    origin: Instant,
}

impl EpochClock {
    /// Starts a clock whose epoch 0 begins now.
    pub fn start() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(origin: Instant) -> Self {
        Self { origin }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn now(&self) -> Epoch {
        self.epoch_at(Instant::now())
    }

    pub fn epoch_at(&self, at: Instant) -> Epoch {
        let elapsed = at.saturating_duration_since(self.origin);
        Epoch((elapsed.as_nanos() / EPOCH_LENGTH.as_nanos()) as u64)
    }

    /// Instant at which `epoch` begins.
    pub fn boundary(&self, epoch: Epoch) -> Instant {
        self.origin + Duration::from_nanos(EPOCH_LENGTH.as_nanos() as u64 * epoch.0)
    }

    pub fn ticker(&self) -> EpochTicker {
        let mut interval = interval_at(self.boundary(Epoch(1)), EPOCH_LENGTH);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        EpochTicker {
            clock: *self,
            interval,
        }
    }
}

/// Resolves once per epoch boundary.
pub struct EpochTicker {
    clock: EpochClock,
    interval: Interval,
}

impl EpochTicker {
    /// Waits for the next boundary and returns the epoch that just began.
    ///
    /// Boundaries missed while the caller was busy are skipped, so the
    /// returned epoch may jump by more than one.
    pub async fn tick(&mut self) -> Epoch {
        let at = self.interval.tick().await;
        self.clock.epoch_at(at)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EpochTally {
    pub accepted: u64,
    pub greetings_replied: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochReport {
    pub epoch: Epoch,
    pub accepted: u64,
}

#[derive(Debug, Default)]
struct SlotState {
    /// Every position below this one has been classified.
    settled: u64,
    /// Greetings among the settled positions.
    greetings: u64,
    replied: u32,
    /// Positions classified ahead of an earlier, still pending one.
    pending: BTreeMap<u64, bool>,
}

impl SlotState {
    fn resolve(&mut self, seq: u64, greeting: bool) {
        self.pending.insert(seq, greeting);
        while let Some(greeting) = self.pending.remove(&self.settled) {
            if greeting {
                self.greetings += 1;
            }
            self.settled += 1;
        }
    }

    /// Whether the greeting at `seq` gets a reply, or `None` while that
    /// depends on connections accepted before it.
    fn verdict(&self, seq: u64, cap: u64) -> Option<bool> {
        let earlier = self.greetings
            + self.pending.range(..seq).filter(|(_, g)| **g).count() as u64;
        if earlier >= cap {
            Some(false)
        } else if self.settled >= seq {
            Some(true)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct GreetingSlots {
    state: watch::Sender<SlotState>,
}

impl Default for GreetingSlots {
    fn default() -> Self {
        let (state, _) = watch::channel(SlotState::default());
        Self { state }
    }
}

impl GreetingSlots {
    fn resolve(&self, seq: u64, greeting: bool) {
        self.state.send_modify(|s| s.resolve(seq, greeting));
    }

    async fn claim(&self, seq: u64, cap: u32) -> bool {
        let cap = u64::from(cap);
        let mut rx = self.state.subscribe();
        let granted = match rx.wait_for(|s| s.verdict(seq, cap).is_some()).await {
            Ok(state) => state.verdict(seq, cap) == Some(true),
            Err(_) => false,
        };

        self.state.send_modify(|s| {
            s.resolve(seq, true);
            if granted {
                s.replied += 1;
            }
        });
        granted
    }

    fn replied(&self) -> u32 {
        self.state.borrow().replied
    }
}

/// One accepted connection's place in its epoch.
///
/// Until it is settled, greetings accepted after it in the same epoch wait
/// for it. Dropping an unsettled admission settles it as not a greeting.
#[derive(Debug)]
pub struct Admission {
    epoch: Epoch,
    seq: u64,
    slots: Arc<GreetingSlots>,
    settled: bool,
}

impl Admission {
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Zero-based acceptance position within the epoch.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Marks the connection as something other than a greeting.
    pub fn settle(&mut self) {
        if !self.settled {
            self.slots.resolve(self.seq, false);
            self.settled = true;
        }
    }

    /// Claims a greeting reply. Granted when fewer than `cap` connections
    /// accepted earlier in the epoch were greetings. Waits for earlier
    /// connections still being classified.
    ///
    /// Cancel safe: a dropped claim settles the admission as not a greeting.
    pub async fn claim_greeting(&mut self, cap: u32) -> bool {
        if self.settled {
            return false;
        }
        let granted = self.slots.claim(self.seq, cap).await;
        self.settled = true;
        granted
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.settle();
    }
}

#[derive(Debug, Default)]
struct EpochWindow {
    accepted: u64,
    slots: Arc<GreetingSlots>,
}

pub struct EpochCounter {
    clock: EpochClock,
    windows: DashMap<Epoch, EpochWindow>,
}

impl EpochCounter {
    pub fn new(clock: EpochClock) -> Self {
        Self {
            clock,
            windows: DashMap::new(),
        }
    }

    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    /// Records one connection in the current epoch and returns that epoch.
    /// The connection never takes part in greeting replies.
    pub fn record(&self) -> Epoch {
        self.record_at(Instant::now())
    }

    pub fn record_at(&self, at: Instant) -> Epoch {
        self.admit_at(at).epoch()
    }

    /// Records one connection in the current epoch and hands back its
    /// admission. Calls must be made in acceptance order.
    pub fn admit(&self) -> Admission {
        self.admit_at(Instant::now())
    }

    pub fn admit_at(&self, at: Instant) -> Admission {
        let epoch = self.clock.epoch_at(at);
        let mut window = self.windows.entry(epoch).or_default();
        let seq = window.accepted;
        window.accepted += 1;
        Admission {
            epoch,
            seq,
            slots: Arc::clone(&window.slots),
            settled: false,
        }
    }

    pub fn tally(&self, epoch: Epoch) -> EpochTally {
        self.windows
            .get(&epoch)
            .map(|w| EpochTally {
                accepted: w.accepted,
                greetings_replied: w.slots.replied(),
            })
            .unwrap_or_default()
    }

    pub fn accepted(&self, epoch: Epoch) -> u64 {
        self.windows.get(&epoch).map(|w| w.accepted).unwrap_or(0)
    }

    /// Returns the accepted count of a completed epoch and forgets every
    /// epoch before it.
    pub fn report_completed(&self, epoch: Epoch) -> EpochReport {
        let accepted = self.accepted(epoch);
        self.windows.retain(|e, _| *e >= epoch);
        EpochReport { epoch, accepted }
    }

    /// Number of epochs currently held in memory.
    pub fn retained(&self) -> usize {
        self.windows.len()
    }
}

/// Reports every completed epoch of `counter` until cancelled. Epochs with no
/// connections are reported as zero.
pub async fn report_epochs<F>(
    counter: &EpochCounter,
    label: &'static str,
    cancel: CancellationToken,
    mut on_report: F,
) where
    F: FnMut(EpochReport),
{
    let mut ticker = counter.clock().ticker();
    let mut next = Epoch(0);

    loop {
        let current = tokio::select! {
            epoch = ticker.tick() => epoch,
            _ = cancel.cancelled() => break,
        };

        while next < current {
            let report = counter.report_completed(next);
            info!(
                counter = label,
                epoch = report.epoch.0,
                connections = report.accepted,
                "Epoch completed"
            );
            on_report(report);
            next = next.next();
        }
    }
}
