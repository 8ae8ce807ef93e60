use reveille::alarm::{AlarmRecord, AlarmStore, ManualClock};
use reveille::{AlarmState, ReveilleConfig};

use crate::helpers::{T0, boot, boot_with, raw_store, state_on_disk};

#[tokio::test]
async fn firing_record_is_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);

    {
        let host = boot(dir.path(), &clock);
        host.engine.start().await.unwrap();
        host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
    }
    // Killed after the Firing write, before the presenter ran.
    clock.advance(1_000);
    raw_store(dir.path())
        .transition("s1", AlarmState::Scheduled, AlarmState::Firing, T0 + 1_000)
        .unwrap();

    let mut host = boot(dir.path(), &clock);
    let report = host.engine.start().await.unwrap();
    assert_eq!(report.redelivered, vec!["s1".to_owned()]);
    assert_eq!(
        host.presentations(),
        vec![("s1".to_owned(), "Wake".to_owned())]
    );
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Delivered));

    host.engine.acknowledge("s1").await.unwrap();
}

#[tokio::test]
async fn delivered_record_is_shown_again_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);

    {
        let host = boot(dir.path(), &clock);
        host.engine.start().await.unwrap();
        host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
        host.fire_due(clock.advance(1_000)).await;
    }

    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();
    assert_eq!(host.presentations().len(), 1);
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Delivered));
}

#[tokio::test]
async fn pending_alarm_is_rearmed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);

    {
        let host = boot(dir.path(), &clock);
        host.engine.start().await.unwrap();
        host.engine.schedule("s1", "Wake", T0 + 60_000).await.unwrap();
    }

    let mut host = boot(dir.path(), &clock);
    assert_eq!(host.timer.armed_count(), 0);
    let report = host.engine.start().await.unwrap();
    assert_eq!(report.rearmed, vec!["s1".to_owned()]);
    assert_eq!(host.timer.armed_fire_at("s1"), Some(T0 + 60_000));

    let outcomes = host.fire_due(clock.advance(60_000)).await;
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].is_delivered());
    assert_eq!(host.presentations().len(), 1);
}

#[tokio::test]
async fn record_without_timer_is_armed_on_start() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);

    // Killed between the durable write and arming.
    raw_store(dir.path())
        .put(&AlarmRecord::scheduled("s1", "Wake", T0 + 5_000, T0))
        .unwrap();

    let host = boot(dir.path(), &clock);
    let report = host.engine.start().await.unwrap();
    assert_eq!(report.rearmed, vec!["s1".to_owned()]);
    assert!(
        raw_store(dir.path())
            .get("s1")
            .unwrap()
            .armed_timer_token
            .is_some()
    );
}

#[tokio::test]
async fn alarm_missed_while_down_expires_silently() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);

    {
        let host = boot(dir.path(), &clock);
        host.engine.start().await.unwrap();
        host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
    }
    clock.advance(10 * 60_000);

    let mut host = boot(dir.path(), &clock);
    let report = host.engine.start().await.unwrap();
    assert_eq!(report.expired, vec!["s1".to_owned()]);
    assert!(host.presentations().is_empty());
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Expired));

    // Kept until the next cleanup pass.
    let next = host.engine.on_boot_completed().await.unwrap();
    assert_eq!(next.purged, vec!["s1".to_owned()]);
    assert_eq!(state_on_disk(dir.path(), "s1"), None);
}

#[tokio::test]
async fn alarm_missed_within_grace_rings_late() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut config = ReveilleConfig::default();
    config.recovery.grace_period_ms = 5 * 60_000;

    {
        let host = boot_with(dir.path(), &clock, &config);
        host.engine.start().await.unwrap();
        host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();
    }
    clock.advance(2 * 60_000);

    let mut host = boot_with(dir.path(), &clock, &config);
    let report = host.engine.start().await.unwrap();
    assert_eq!(report.fired_late, vec!["s1".to_owned()]);
    assert_eq!(host.presentations().len(), 1);
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Delivered));
}

#[tokio::test]
async fn presenter_outage_is_repaired_by_reconcile() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();
    host.engine.schedule("s1", "Wake", T0 + 1_000).await.unwrap();

    // No UI subscribed when the alarm fires.
    let (_, closed) = tokio::sync::broadcast::channel(1);
    drop(std::mem::replace(&mut host.events, closed));
    let outcomes = host.fire_due(clock.advance(1_000)).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Firing));

    // The UI comes back; the next pass delivers.
    host.events = host.presenter.subscribe();
    let report = host.engine.reconcile().await.unwrap();
    assert_eq!(report.redelivered, vec!["s1".to_owned()]);
    assert_eq!(host.presentations().len(), 1);
    assert_eq!(state_on_disk(dir.path(), "s1"), Some(AlarmState::Delivered));
}

#[tokio::test]
async fn reconcile_twice_has_no_duplicate_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    {
        let host = boot(dir.path(), &clock);
        host.engine.start().await.unwrap();
        host.engine.schedule("a", "A", T0 + 60_000).await.unwrap();
        host.engine.schedule("b", "B", T0 + 120_000).await.unwrap();
    }

    let host = boot(dir.path(), &clock);
    let first = host.engine.start().await.unwrap();
    assert_eq!(first.rearmed.len(), 2);
    let second = host.engine.reconcile().await.unwrap();
    assert!(second.rearmed.is_empty());
    assert_eq!(second.untouched.len(), 2);
    assert_eq!(host.timer.armed_count(), 2);
}

#[tokio::test]
async fn record_written_by_short_lived_writer_rings_on_host_sweep() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    {
        // A second process schedules and exits; its timer dies with it.
        let writer = boot(dir.path(), &clock);
        writer.engine.schedule("s2", "Tea", T0 + 10_000).await.unwrap();
    }
    clock.advance(30_000);

    let report = host.engine.reconcile().await.unwrap();
    assert!(report.expired.is_empty());
    assert_eq!(report.fired_late, vec!["s2".to_owned()]);
    assert_eq!(
        host.presentations(),
        vec![("s2".to_owned(), "Tea".to_owned())]
    );
    assert_eq!(state_on_disk(dir.path(), "s2"), Some(AlarmState::Delivered));
}
