//! Shared helpers for integration tests.
//!
//! A [`Host`] is one simulated process lifetime: a file-backed store in a
//! temp dir, a fresh host-driven timer set, and a presentation channel.
//! Booting a second `Host` on the same directory models a process restart:
//! the records survive, the timers do not.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reveille::ReveilleConfig;
use reveille::alarm::{
    AlarmEngine, AlarmStore, ChannelPresenter, FireOrigin, FireOutcome, ManualClock,
    ManualWakeTimer, PresentationEvent, SqliteAlarmStore, WakeTimer,
};
use tokio::sync::broadcast;

/// Fixed simulated start time (2023-11-14T22:13:20Z).
pub(crate) const T0: i64 = 1_700_000_000_000;

pub(crate) struct Host {
    pub engine: Arc<AlarmEngine>,
    pub timer: Arc<ManualWakeTimer>,
    pub presenter: ChannelPresenter,
    pub events: broadcast::Receiver<PresentationEvent>,
}

/// Boot a host on `dir` with default configuration.
pub(crate) fn boot(dir: &Path, clock: &ManualClock) -> Host {
    boot_with(dir, clock, &ReveilleConfig::default())
}

pub(crate) fn boot_with(dir: &Path, clock: &ManualClock, config: &ReveilleConfig) -> Host {
    let store = SqliteAlarmStore::open(dir, Duration::from_secs(5)).expect("open store");
    let timer = Arc::new(ManualWakeTimer::new());
    let presenter = ChannelPresenter::new(64);
    let events = presenter.subscribe();
    let engine = AlarmEngine::new(
        config,
        Arc::new(store),
        Arc::clone(&timer) as Arc<dyn WakeTimer>,
        Arc::new(presenter.clone()),
        Arc::new(clock.clone()),
    );
    Host {
        engine: Arc::new(engine),
        timer,
        presenter,
        events,
    }
}

/// A second handle on the database, for inspecting or corrupting state
/// behind the engine's back.
pub(crate) fn raw_store(dir: &Path) -> SqliteAlarmStore {
    SqliteAlarmStore::open(dir, Duration::from_secs(5)).expect("open raw store")
}

impl Host {
    /// Dispatch every timer due at `now`, as the platform would.
    pub(crate) async fn fire_due(&self, now: i64) -> Vec<FireOutcome> {
        let mut outcomes = Vec::new();
        for fired in self.timer.pop_due(now) {
            let outcome = self
                .engine
                .on_fire(&fired.slot_id, FireOrigin::Timer(fired.token))
                .await
                .expect("dispatch");
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Drain pending `Present` events as `(slot_id, title)` pairs.
    pub(crate) fn presentations(&mut self) -> Vec<(String, String)> {
        let mut shown = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let PresentationEvent::Present { slot_id, title } = event {
                shown.push((slot_id, title));
            }
        }
        shown
    }
}

/// Number of `Scheduled -> Firing` transitions in the audit trail.
pub(crate) fn firing_count(host: &Host, slot_id: &str) -> usize {
    host.engine
        .history(slot_id)
        .expect("history")
        .into_iter()
        .filter(|entry| entry.to == reveille::AlarmState::Firing)
        .count()
}

/// Current state of `slot_id`, read straight from disk.
pub(crate) fn state_on_disk(dir: &Path, slot_id: &str) -> Option<reveille::AlarmState> {
    raw_store(dir).get(slot_id).ok().map(|record| record.state)
}
