use reveille::alarm::{FireOrigin, FireOutcome, IgnoreReason, ManualClock};
use reveille::{AlarmError, AlarmState};

use crate::helpers::{T0, boot, state_on_disk};

#[tokio::test]
async fn schedule_leaves_exactly_one_scheduled_record() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    host.engine.schedule("s1", "Wake", T0 + 60_000).await.unwrap();

    let all = host.engine.list_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].slot_id, "s1");
    assert_eq!(all[0].state, AlarmState::Scheduled);
    assert!(all[0].armed_timer_token.is_some());
}

#[tokio::test]
async fn scheduling_twice_keeps_the_later_time() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
    host.engine.schedule("s1", "Wake", T0 + 5_000).await.unwrap();

    let all = host.engine.list_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].fire_at, T0 + 5_000);

    // The first registration is gone: nothing rings at the old time.
    assert!(host.fire_due(clock.advance(1_000)).await.is_empty());
    assert!(host.presentations().is_empty());
    let outcomes = host.fire_due(clock.advance(4_000)).await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_delivered());
}

#[tokio::test]
async fn wake_example_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();

    let outcomes = host.fire_due(clock.advance(1_000)).await;
    assert_eq!(outcomes.len(), 1);
    let FireOutcome::Delivered(record) = &outcomes[0] else {
        panic!("expected delivery, got {:?}", outcomes[0]);
    };
    assert_eq!(record.state, AlarmState::Delivered);
    assert_eq!(
        host.presentations(),
        vec![("s1".to_owned(), "Wake".to_owned())]
    );

    let acked = host.engine.acknowledge("s1").await.unwrap();
    assert_eq!(acked.state, AlarmState::Acknowledged);
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Acknowledged));

    let report = host.engine.reconcile().await.unwrap();
    assert_eq!(report.purged, vec!["s1".to_owned()]);
    assert!(host.engine.list_all().unwrap().is_empty());

    let trail: Vec<AlarmState> = host
        .engine
        .history("s1")
        .unwrap()
        .into_iter()
        .map(|entry| entry.to)
        .collect();
    assert_eq!(
        trail,
        vec![
            AlarmState::Scheduled,
            AlarmState::Firing,
            AlarmState::Delivered,
            AlarmState::Acknowledged,
        ]
    );
}

#[tokio::test]
async fn cancelled_alarm_never_presents() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    let record = host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
    let token = record.armed_timer_token.clone().unwrap();
    host.engine.cancel("s1").await.unwrap();
    clock.advance(1_000);

    // A late platform callback and a boot trigger both bounce.
    let late = host
        .engine
        .on_fire("s1", FireOrigin::Timer(token))
        .await
        .unwrap();
    assert_eq!(
        late,
        FireOutcome::Ignored(IgnoreReason::NotScheduled(AlarmState::Cancelled))
    );
    let boot_fire = host.engine.on_fire("s1", FireOrigin::Boot).await.unwrap();
    assert!(!boot_fire.is_delivered());

    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Cancelled));
    assert!(host.presentations().is_empty());
}

#[tokio::test]
async fn acknowledging_a_pending_alarm_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
    let err = host.engine.acknowledge("s1").await.unwrap_err();
    assert!(matches!(
        err,
        AlarmError::InvalidStateTransition {
            from: AlarmState::Scheduled,
            to: AlarmState::Acknowledged,
            ..
        }
    ));
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Scheduled));

    assert!(matches!(
        host.engine.acknowledge("nope").await,
        Err(AlarmError::NotFound(_))
    ));
}

#[tokio::test]
async fn delivered_alarm_resolves_only_through_acknowledge() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
    host.fire_due(clock.advance(1_000)).await;
    host.presentations();

    // Every other path leaves it ringing.
    assert!(host.engine.cancel("s1").await.is_err());
    assert!(host.engine.reschedule("s1", T0 + 90_000).await.is_err());
    assert!(host.engine.schedule("s1", "Other", T0 + 90_000).await.is_err());
    assert!(!host.engine.on_fire("s1", FireOrigin::Boot).await.unwrap().is_delivered());
    host.engine.on_boot_completed().await.unwrap();
    clock.advance(24 * 3_600_000);
    host.engine.reconcile().await.unwrap();
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Delivered));

    // A relaunched UI can redisplay it without changing state.
    host.engine.present("s1").await.unwrap();
    assert!(!host.presentations().is_empty());
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Delivered));

    host.engine.acknowledge("s1").await.unwrap();
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Acknowledged));
}

#[tokio::test]
async fn reschedule_moves_the_fire_time() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    host.engine.schedule("s1", "Standup", T0 + 1_000).await.unwrap();
    host.engine.reschedule("s1", T0 + 10_000).await.unwrap();

    assert!(host.fire_due(clock.advance(1_000)).await.is_empty());
    let outcomes = host.fire_due(clock.advance(9_000)).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(
        host.presentations(),
        vec![("s1".to_owned(), "Standup".to_owned())]
    );
}
