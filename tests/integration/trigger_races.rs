//! Concurrent triggers against the same and different slots.

use std::sync::Arc;

use reveille::alarm::{Clock, FireOrigin, FireOutcome, IgnoreReason, ManualClock};
use reveille::{AlarmError, AlarmState, ReveilleConfig};

use crate::helpers::{T0, boot, boot_with, firing_count, state_on_disk};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fire_racing_cancel_has_one_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    for round in 0..20 {
        let slot_id = format!("race-{round}");
        let record = host
            .engine
            .schedule(&slot_id, "Race", clock.now_millis() + 1_000)
            .await
            .unwrap();
        let token = record.armed_timer_token.unwrap();
        clock.advance(1_000);

        let fire_engine = Arc::clone(&host.engine);
        let fire_slot = slot_id.clone();
        let fire = tokio::spawn(async move {
            fire_engine
                .on_fire(&fire_slot, FireOrigin::Timer(token))
                .await
        });
        let cancel_engine = Arc::clone(&host.engine);
        let cancel_slot = slot_id.clone();
        let cancel = tokio::spawn(async move { cancel_engine.cancel(&cancel_slot).await });

        let fired = fire.await.unwrap().unwrap();
        let cancelled = cancel.await.unwrap();
        let presented = host.presentations().len();

        match state_on_disk(dir.path(), &slot_id) {
            Some(AlarmState::Cancelled) => {
                assert!(cancelled.is_ok(), "round {round}");
                assert!(!fired.is_delivered(), "round {round}");
                assert_eq!(presented, 0, "round {round}");
            }
            Some(AlarmState::Delivered) => {
                assert!(
                    matches!(cancelled, Err(AlarmError::InvalidStateTransition { .. })),
                    "round {round}"
                );
                assert!(fired.is_delivered(), "round {round}");
                assert_eq!(presented, 1, "round {round}");
            }
            other => panic!("round {round}: unexpected final state {other:?}"),
        }
    }
}

async fn all_trigger_sources_at_once(config: &ReveilleConfig) {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot_with(dir.path(), &clock, config);
    host.engine.start().await.unwrap();

    let record = host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
    let token = record.armed_timer_token.unwrap();
    clock.advance(1_000);
    // Platform lost the registration, so reconcile also sees a due alarm.
    host.timer.pop_due(clock.now_millis());

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let engine = Arc::clone(&host.engine);
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            engine.on_fire("s1", FireOrigin::Timer(token)).await.map(|_| ())
        }));
        let engine = Arc::clone(&host.engine);
        tasks.push(tokio::spawn(async move {
            engine.on_fire("s1", FireOrigin::Boot).await.map(|_| ())
        }));
        let engine = Arc::clone(&host.engine);
        tasks.push(tokio::spawn(async move {
            engine.on_boot_completed().await.map(|_| ())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(firing_count(&host, "s1"), 1);
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Delivered));
    // The first delivery plus any redisplays from later reconcile passes.
    assert!(!host.presentations().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_trigger_source_at_once_delivers_once() {
    all_trigger_sources_at_once(&ReveilleConfig::default()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_trigger_source_at_once_delivers_once_with_grace() {
    let mut config = ReveilleConfig::default();
    config.recovery.grace_period_ms = 60_000;
    all_trigger_sources_at_once(&config).await;
}

#[tokio::test]
async fn reconcile_between_timer_fire_and_dispatch_delivers() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    let record = host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
    let token = record.armed_timer_token.unwrap();
    let now = clock.advance(1_000);
    // The platform has fired the timer; the dispatch is still queued.
    assert_eq!(host.timer.pop_due(now).len(), 1);

    let report = host.engine.on_boot_completed().await.unwrap();
    assert!(report.expired.is_empty());
    assert_eq!(report.fired_late, vec!["s1".to_owned()]);

    let outcome = host
        .engine
        .on_fire("s1", FireOrigin::Timer(token))
        .await
        .unwrap();
    assert!(!outcome.is_delivered());
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Delivered));
    assert_eq!(host.presentations().len(), 1);
    assert_eq!(firing_count(&host, "s1"), 1);
}

#[tokio::test]
async fn unconfirmed_cancel_leaves_a_single_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
    host.timer.fail_next_disarms(1);
    assert!(matches!(
        host.engine.cancel("s1").await,
        Err(AlarmError::CancelInFlight { .. })
    ));
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Scheduled));

    // The registration survived, so the alarm still rings exactly once.
    let outcomes = host.fire_due(clock.advance(1_000)).await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_delivered());
    let again = host.engine.on_fire("s1", FireOrigin::Boot).await.unwrap();
    assert_eq!(
        again,
        FireOutcome::Ignored(IgnoreReason::NotScheduled(AlarmState::Delivered))
    );
    assert_eq!(host.presentations().len(), 1);
    assert_eq!(firing_count(&host, "s1"), 1);

    // Retrying the cancel now reports that the alarm is already ringing.
    assert!(matches!(
        host.engine.cancel("s1").await,
        Err(AlarmError::InvalidStateTransition {
            from: AlarmState::Delivered,
            ..
        })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_slots_schedule_independently() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let engine = Arc::clone(&host.engine);
        tasks.push(tokio::spawn(async move {
            engine
                .schedule(&format!("slot-{i}"), "Parallel", T0 + 1_000 + i)
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let all = host.engine.list_all().unwrap();
    assert_eq!(all.len(), 16);
    assert!(all.iter().all(|r| r.state == AlarmState::Scheduled));
    assert_eq!(host.timer.armed_count(), 16);
}
