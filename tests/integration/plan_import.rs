use reveille::alarm::{ManualClock, PlanSlot};
use reveille::{AlarmError, AlarmState};

use crate::helpers::{T0, boot};

#[tokio::test]
async fn json_plan_schedules_the_rest_of_the_day() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let mut host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    let raw = format!(
        r#"[
            {{ "slot_id": "breakfast", "title": "Breakfast", "fire_at": {past} }},
            {{ "slot_id": "lunch", "title": "Lunch", "fire_at": {soon} }},
            {{ "slot_id": "water", "fire_at": {later} }}
        ]"#,
        past = T0 - 3_600_000,
        soon = T0 + 1_000,
        later = T0 + 2_000,
    );
    let plan: Vec<PlanSlot> = serde_json::from_str(&raw).unwrap();

    let outcome = host.engine.schedule_plan(&plan).await;
    assert!(outcome.is_clean());
    assert_eq!(outcome.scheduled, vec!["lunch".to_owned(), "water".to_owned()]);
    assert_eq!(outcome.skipped_past, vec!["breakfast".to_owned()]);

    let records = host.engine.list_all().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].title, "Alarm");

    let outcomes = host.fire_due(clock.advance(2_000)).await;
    assert_eq!(outcomes.len(), 2);
    let shown: Vec<String> = host
        .presentations()
        .into_iter()
        .map(|(slot_id, _)| slot_id)
        .collect();
    assert_eq!(shown, vec!["lunch".to_owned(), "water".to_owned()]);
}

#[tokio::test]
async fn plan_failures_do_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(T0);
    let host = boot(dir.path(), &clock);
    host.engine.start().await.unwrap();

    // "busy" is already ringing and must not be replaced.
    host.engine.schedule("busy", "Busy", T0 + 500).await.unwrap();
    host.fire_due(clock.advance(500)).await;

    let plan = vec![
        PlanSlot {
            slot_id: "busy".to_owned(),
            title: "Replacement".to_owned(),
            fire_at: T0 + 60_000,
        },
        PlanSlot {
            slot_id: "fresh".to_owned(),
            title: "Fresh".to_owned(),
            fire_at: T0 + 60_000,
        },
    ];
    let outcome = host.engine.schedule_plan(&plan).await;
    assert_eq!(outcome.scheduled, vec!["fresh".to_owned()]);
    assert_eq!(outcome.failed.len(), 1);
    assert!(matches!(
        outcome.failed[0].1,
        AlarmError::InvalidStateTransition {
            from: AlarmState::Delivered,
            ..
        }
    ));
    assert_eq!(host.engine.get("busy").unwrap().title, "Busy");
}
