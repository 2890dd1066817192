use std::time::Duration;

use tcpflood::engine::epoch::report_epochs;
use tcpflood::{Epoch, EpochClock, EpochCounter, EpochReport};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[tokio::test(start_paused = true)]
async fn test_epoch_at_maps_instants_to_whole_seconds() {
    let origin = Instant::now();
    let clock = EpochClock::starting_at(origin);

    assert_eq!(clock.epoch_at(origin), Epoch(0));
    assert_eq!(clock.epoch_at(origin + ms(999)), Epoch(0));
    assert_eq!(clock.epoch_at(origin + ms(1000)), Epoch(1));
    assert_eq!(clock.epoch_at(origin + ms(3500)), Epoch(3));
    assert_eq!(clock.boundary(Epoch(2)), origin + Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_epochs_never_go_backwards() {
    let clock = EpochClock::start();
    let mut last = clock.now();
    for _ in 0..25 {
        sleep(ms(130)).await;
        let now = clock.now();
        assert!(now >= last);
        last = now;
    }
    assert_eq!(last, Epoch(3));
}

#[tokio::test(start_paused = true)]
async fn test_ticker_returns_each_new_epoch() {
    let clock = EpochClock::start();
    let mut ticker = clock.ticker();

    assert_eq!(ticker.tick().await, Epoch(1));
    assert_eq!(clock.now(), Epoch(1));
    assert_eq!(ticker.tick().await, Epoch(2));
    assert_eq!(clock.now(), Epoch(2));
}

#[tokio::test(start_paused = true)]
async fn test_ticker_skips_missed_boundaries() {
    let clock = EpochClock::start();
    let mut ticker = clock.ticker();

    sleep(ms(3500)).await;
    // The overdue boundary fires first, then the schedule realigns.
    assert_eq!(ticker.tick().await, Epoch(1));
    assert_eq!(ticker.tick().await, Epoch(4));
}

#[tokio::test(start_paused = true)]
async fn test_counter_attributes_connections_to_their_epoch() {
    let clock = EpochClock::start();
    let origin = clock.origin();
    let counter = EpochCounter::new(clock);

    assert_eq!(counter.record_at(origin), Epoch(0));
    assert_eq!(counter.record_at(origin + ms(400)), Epoch(0));
    assert_eq!(counter.record_at(origin + ms(1200)), Epoch(1));
    assert_eq!(counter.record_at(origin + ms(2100)), Epoch(2));

    assert_eq!(counter.accepted(Epoch(0)), 2);
    assert_eq!(counter.accepted(Epoch(1)), 1);
    assert_eq!(counter.accepted(Epoch(7)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_report_prunes_older_epochs() {
    let clock = EpochClock::start();
    let origin = clock.origin();
    let counter = EpochCounter::new(clock);

    for offset in [0, 100, 1100, 2100, 2200] {
        counter.record_at(origin + ms(offset));
    }
    assert_eq!(counter.retained(), 3);

    let report = counter.report_completed(Epoch(0));
    assert_eq!(report, EpochReport { epoch: Epoch(0), accepted: 2 });
    assert_eq!(counter.retained(), 3);

    let report = counter.report_completed(Epoch(1));
    assert_eq!(report.accepted, 1);
    assert_eq!(counter.retained(), 2);
    assert_eq!(counter.accepted(Epoch(0)), 0);
    assert_eq!(counter.accepted(Epoch(2)), 2);
}

#[tokio::test(start_paused = true)]
async fn test_greeting_claims_are_capped_per_epoch() {
    let clock = EpochClock::start();
    let origin = clock.origin();
    let counter = EpochCounter::new(clock);

    let mut admissions: Vec<_> = (0..10).map(|_| counter.admit_at(origin)).collect();
    let mut next_epoch = counter.admit_at(origin + ms(1500));

    let mut granted = Vec::new();
    for admission in admissions.iter_mut() {
        granted.push(admission.claim_greeting(8).await);
    }
    assert_eq!(granted, [vec![true; 8], vec![false; 2]].concat());
    assert_eq!(counter.tally(Epoch(0)).greetings_replied, 8);
    assert_eq!(counter.tally(Epoch(0)).accepted, 10);

    // Another epoch has its own allowance.
    assert_eq!(next_epoch.epoch(), Epoch(1));
    assert_eq!(next_epoch.seq(), 0);
    assert!(next_epoch.claim_greeting(8).await);
}

#[tokio::test(start_paused = true)]
async fn test_greeting_slots_follow_acceptance_order() {
    let clock = EpochClock::start();
    let origin = clock.origin();
    let counter = EpochCounter::new(clock);

    let mut first = counter.admit_at(origin);
    let later: Vec<_> = (1..=9)
        .map(|i| counter.admit_at(origin + ms(i * 10)))
        .map(|mut admission| tokio::spawn(async move { admission.claim_greeting(8).await }))
        .collect();

    // Later greetings are held while the first connection is unclassified.
    sleep(ms(300)).await;
    assert!(later.iter().all(|h| !h.is_finished()));

    assert!(first.claim_greeting(8).await);

    let mut granted = Vec::new();
    for handle in later {
        granted.push(handle.await.unwrap());
    }
    assert_eq!(granted, [vec![true; 7], vec![false; 2]].concat());
    assert_eq!(counter.tally(Epoch(0)).greetings_replied, 8);
}

#[tokio::test(start_paused = true)]
async fn test_non_greetings_release_waiting_claims() {
    let clock = EpochClock::start();
    let origin = clock.origin();
    let counter = EpochCounter::new(clock);

    let mut stream = counter.admit_at(origin);
    let silent = counter.admit_at(origin);
    let mut greeting = counter.admit_at(origin);

    let claim = tokio::spawn(async move { greeting.claim_greeting(1).await });
    sleep(ms(50)).await;
    assert!(!claim.is_finished());

    stream.settle();
    sleep(ms(50)).await;
    assert!(!claim.is_finished());

    // A connection that goes away before classification no longer holds
    // anyone up.
    drop(silent);
    assert!(claim.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_spent_cap_denies_without_waiting() {
    let clock = EpochClock::start();
    let origin = clock.origin();
    let counter = EpochCounter::new(clock);

    let mut first = counter.admit_at(origin);
    let _unclassified = counter.admit_at(origin);
    let mut third = counter.admit_at(origin);

    assert!(first.claim_greeting(1).await);
    let granted = timeout(ms(10), third.claim_greeting(1))
        .await
        .expect("cap already spent by an earlier greeting");
    assert!(!granted);
}

#[tokio::test(start_paused = true)]
async fn test_pruned_epoch_keeps_pending_greeting_slots() {
    let clock = EpochClock::start();
    let origin = clock.origin();
    let counter = EpochCounter::new(clock);

    let mut late = counter.admit_at(origin + ms(850));
    counter.record_at(origin + ms(1200));
    counter.record_at(origin + ms(2100));

    counter.report_completed(Epoch(0));
    counter.report_completed(Epoch(1));
    assert_eq!(counter.accepted(Epoch(0)), 0);

    assert_eq!(late.epoch(), Epoch(0));
    assert!(late.claim_greeting(8).await);
}

#[tokio::test(start_paused = true)]
async fn test_reporter_emits_every_epoch_including_idle_ones() {
    let clock = EpochClock::start();
    let origin = clock.origin();
    let counter = EpochCounter::new(clock);

    counter.record_at(origin + ms(100));
    counter.record_at(origin + ms(900));
    counter.record_at(origin + ms(2500));

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        sleep(ms(3200)).await;
        stopper.cancel();
    });

    let mut reports = Vec::new();
    report_epochs(&counter, "test", cancel, |r| reports.push(r)).await;

    assert_eq!(
        reports,
        vec![
            EpochReport { epoch: Epoch(0), accepted: 2 },
            EpochReport { epoch: Epoch(1), accepted: 0 },
            EpochReport { epoch: Epoch(2), accepted: 1 },
        ]
    );
    assert!(counter.retained() <= 2);
}
