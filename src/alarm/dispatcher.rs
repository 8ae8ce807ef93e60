//! Fire-time entry point.
//!
//! Every trigger source funnels through [`TriggerDispatcher::on_fire`]. The
//! `Scheduled -> Firing` edge is a compare-and-swap at the store, taken under
//! the slot lock, so duplicate or racing triggers produce at most one
//! delivery.

use std::sync::Arc;

use tokio::sync::watch;

use super::clock::Clock;
use super::delivery::DeliveryGate;
use super::locks::SlotLocks;
use super::record::{AlarmRecord, AlarmState, TimerToken};
use super::store::AlarmStore;
use crate::error::{AlarmError, Result};

/// Who asked for the fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOrigin {
    /// A wake timer expired. Carries the token it was armed with.
    Timer(TimerToken),
    /// The device finished booting.
    Boot,
    /// The recovery pass found a missed alarm inside the grace window.
    Recovery,
}

/// Why a trigger did not deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// No record for the slot.
    Missing,
    /// The record had already left `Scheduled`.
    NotScheduled(AlarmState),
    /// Timer token does not match the armed one.
    StaleToken,
    /// A non-timer trigger arrived before the fire time.
    NotDue,
}

/// Result of one trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// The alarm fired. The record is `Delivered`, or `Firing` if the
    /// presenter failed and a later reconcile must redeliver it.
    Delivered(AlarmRecord),
    Ignored(IgnoreReason),
}

impl FireOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }
}

/// Gate that holds live triggers back until the startup reconcile is done.
///
/// Clones share state. Once opened it stays open.
#[derive(Debug, Clone)]
pub struct RecoveryBarrier {
    tx: Arc<watch::Sender<bool>>,
}

impl RecoveryBarrier {
    /// A closed barrier.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// A barrier that never blocks.
    pub fn opened() -> Self {
        let barrier = Self::new();
        barrier.open();
        barrier
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until [`open`](Self::open) has been called.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for RecoveryBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves triggers into deliveries.
pub struct TriggerDispatcher {
    store: Arc<dyn AlarmStore>,
    gate: Arc<DeliveryGate>,
    locks: Arc<SlotLocks>,
    clock: Arc<dyn Clock>,
    barrier: RecoveryBarrier,
}

impl TriggerDispatcher {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        gate: Arc<DeliveryGate>,
        locks: Arc<SlotLocks>,
        clock: Arc<dyn Clock>,
        barrier: RecoveryBarrier,
    ) -> Self {
        Self {
            store,
            gate,
            locks,
            clock,
            barrier,
        }
    }

    /// Handle one trigger for `slot_id`.
    ///
    /// Waits for the recovery barrier unless the trigger comes from the
    /// recovery pass itself.
    pub async fn on_fire(&self, slot_id: &str, origin: FireOrigin) -> Result<FireOutcome> {
        if origin != FireOrigin::Recovery {
            self.barrier.wait().await;
        }
        let _guard = self.locks.lock(slot_id).await;
        self.fire_locked(slot_id, &origin).await
    }

    pub(crate) async fn fire_locked(
        &self,
        slot_id: &str,
        origin: &FireOrigin,
    ) -> Result<FireOutcome> {
        let record = match self.store.get(slot_id) {
            Ok(record) => record,
            Err(AlarmError::NotFound(_)) => {
                tracing::debug!(slot_id, ?origin, "fire for unknown slot ignored");
                return Ok(FireOutcome::Ignored(IgnoreReason::Missing));
            }
            Err(e) => return Err(e),
        };

        if record.state != AlarmState::Scheduled {
            tracing::debug!(slot_id, state = %record.state, ?origin, "duplicate fire ignored");
            return Ok(FireOutcome::Ignored(IgnoreReason::NotScheduled(record.state)));
        }

        let now = self.clock.now_millis();
        match origin {
            FireOrigin::Timer(token) if record.armed_timer_token.as_ref() != Some(token) => {
                tracing::debug!(slot_id, token = %token, "stale timer callback ignored");
                return Ok(FireOutcome::Ignored(IgnoreReason::StaleToken));
            }
            FireOrigin::Timer(_) => {}
            FireOrigin::Boot | FireOrigin::Recovery => {
                if record.fire_at > now {
                    return Ok(FireOutcome::Ignored(IgnoreReason::NotDue));
                }
            }
        }

        let firing = match self.store.transition(
            slot_id,
            AlarmState::Scheduled,
            AlarmState::Firing,
            now,
        ) {
            Ok(record) => record,
            Err(AlarmError::InvalidStateTransition { from, .. }) => {
                return Ok(FireOutcome::Ignored(IgnoreReason::NotScheduled(from)));
            }
            Err(e) => return Err(e),
        };
        tracing::info!(slot_id, ?origin, "alarm firing");

        let record = self.gate.present_locked(firing).await?;
        Ok(FireOutcome::Delivered(record))
    }
}
