//! Startup reconciliation.
//!
//! After a process restart or device reboot every in-process timer is gone
//! while the store still says `Scheduled`. [`RecoveryCoordinator::reconcile`]
//! walks the store and repairs each record:
//!
//! | State at pass start                 | Action                             |
//! |-------------------------------------|------------------------------------|
//! | `Scheduled`, live timer             | none                               |
//! | `Scheduled`, future, no timer       | re-arm                             |
//! | `Scheduled`, due while online       | fire now                           |
//! | `Scheduled`, missed, in grace       | fire now                           |
//! | `Scheduled`, missed, no grace       | `Expired`, never delivered         |
//! | `Firing` / `Delivered`              | present again                      |
//! | terminal                            | removed (when purging is enabled)  |
//!
//! "Missed" means the fire time passed before this coordinator came online.
//! A record that fell due afterwards was either fired by a timer whose
//! dispatch has not taken the slot lock yet, or was written by another
//! process whose timers died with it. Both still ring.
//!
//! Records made terminal by this pass are removed by the next one. The pass is
//! idempotent and a failure on one record never stops the sweep.

use std::sync::Arc;
use std::time::Duration;

use super::clock::Clock;
use super::delivery::DeliveryGate;
use super::dispatcher::{FireOrigin, FireOutcome, TriggerDispatcher};
use super::locks::SlotLocks;
use super::record::{AlarmRecord, AlarmState};
use super::scheduler::{AlarmScheduler, DEFAULT_IO_TIMEOUT};
use super::store::AlarmStore;
use super::timer::WakeTimer;
use crate::error::{AlarmError, Result};

/// What one reconcile pass did, slot by slot.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Scheduled with a live timer.
    pub untouched: Vec<String>,
    pub rearmed: Vec<String>,
    /// Past due without a live timer and fired during the pass: either due
    /// since the engine came online, or missed but inside the grace window.
    pub fired_late: Vec<String>,
    pub expired: Vec<String>,
    /// Firing or Delivered records handed to the presenter again.
    pub redelivered: Vec<String>,
    /// Terminal records removed from the store.
    pub purged: Vec<String>,
    /// One `RecoveryPartialFailure` per record that could not be repaired.
    pub failures: Vec<AlarmError>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

enum Repair {
    Untouched,
    Rearmed,
    FiredLate,
    Expired,
    Redelivered,
    Purged,
}

/// Reconciles durable records against live timers.
pub struct RecoveryCoordinator {
    store: Arc<dyn AlarmStore>,
    timer: Arc<dyn WakeTimer>,
    scheduler: Arc<AlarmScheduler>,
    dispatcher: Arc<TriggerDispatcher>,
    gate: Arc<DeliveryGate>,
    locks: Arc<SlotLocks>,
    clock: Arc<dyn Clock>,
    grace_period_ms: i64,
    purge_resolved: bool,
    io_timeout: Duration,
    online_since: i64,
}

impl RecoveryCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn AlarmStore>,
        timer: Arc<dyn WakeTimer>,
        scheduler: Arc<AlarmScheduler>,
        dispatcher: Arc<TriggerDispatcher>,
        gate: Arc<DeliveryGate>,
        locks: Arc<SlotLocks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let online_since = clock.now_millis();
        Self {
            store,
            timer,
            scheduler,
            dispatcher,
            gate,
            locks,
            clock,
            grace_period_ms: 0,
            purge_resolved: true,
            io_timeout: DEFAULT_IO_TIMEOUT,
            online_since,
        }
    }

    /// How late a missed alarm may still fire. Zero expires every missed alarm.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_ms = i64::try_from(grace.as_millis()).unwrap_or(i64::MAX);
        self
    }

    /// Whether reconcile removes terminal records.
    #[must_use]
    pub fn with_purge_resolved(mut self, purge: bool) -> Self {
        self.purge_resolved = purge;
        self
    }

    #[must_use]
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// Epoch millis from which this process was able to ring alarms.
    /// Defaults to the clock reading at construction.
    #[must_use]
    pub fn with_online_since(mut self, online_since: i64) -> Self {
        self.online_since = online_since;
        self
    }

    /// Run one reconcile pass.
    ///
    /// Only a failure to list the store fails the pass as a whole.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let snapshot = self.store.list_all()?;
        let mut report = ReconcileReport::default();

        for record in snapshot {
            let slot_id = record.slot_id.clone();
            match self.repair(&slot_id).await {
                Ok(Repair::Untouched) => report.untouched.push(slot_id),
                Ok(Repair::Rearmed) => report.rearmed.push(slot_id),
                Ok(Repair::FiredLate) => report.fired_late.push(slot_id),
                Ok(Repair::Expired) => report.expired.push(slot_id),
                Ok(Repair::Redelivered) => report.redelivered.push(slot_id),
                Ok(Repair::Purged) => report.purged.push(slot_id),
                Err(e) => {
                    tracing::warn!(slot_id = %slot_id, "reconcile step failed: {e}");
                    report.failures.push(AlarmError::RecoveryPartialFailure {
                        slot_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            rearmed = report.rearmed.len(),
            fired_late = report.fired_late.len(),
            expired = report.expired.len(),
            redelivered = report.redelivered.len(),
            purged = report.purged.len(),
            failures = report.failures.len(),
            "reconcile complete"
        );
        Ok(report)
    }

    /// Remove every terminal record. Returns the removed slot ids.
    pub async fn purge_resolved(&self) -> Result<Vec<String>> {
        let mut purged = Vec::new();
        for record in self.store.list_all()? {
            if !record.state.is_terminal() {
                continue;
            }
            let _guard = self.locks.lock(&record.slot_id).await;
            match self.store.get(&record.slot_id) {
                Ok(current) if current.state.is_terminal() => {
                    self.store.remove(&record.slot_id)?;
                    purged.push(record.slot_id);
                }
                Ok(_) | Err(AlarmError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(count = purged.len(), "purged resolved alarms");
        Ok(purged)
    }

    async fn repair(&self, slot_id: &str) -> Result<Repair> {
        let _guard = self.locks.lock(slot_id).await;
        // Re-read under the lock; the snapshot may be stale.
        let record = match self.store.get(slot_id) {
            Ok(record) => record,
            Err(AlarmError::NotFound(_)) => return Ok(Repair::Untouched),
            Err(e) => return Err(e),
        };

        match record.state {
            AlarmState::Scheduled => self.repair_scheduled(record).await,
            AlarmState::Firing | AlarmState::Delivered => {
                self.gate.present_locked(record).await?;
                Ok(Repair::Redelivered)
            }
            AlarmState::Acknowledged | AlarmState::Cancelled | AlarmState::Expired => {
                if !self.purge_resolved {
                    return Ok(Repair::Untouched);
                }
                self.store.remove(slot_id)?;
                tracing::debug!(slot_id, state = %record.state, "resolved alarm removed");
                Ok(Repair::Purged)
            }
        }
    }

    async fn repair_scheduled(&self, record: AlarmRecord) -> Result<Repair> {
        if self.has_live_timer(&record).await {
            return Ok(Repair::Untouched);
        }

        let now = self.clock.now_millis();
        if record.fire_at > now {
            self.scheduler.arm(&record).await?;
            tracing::info!(slot_id = %record.slot_id, fire_at = record.fire_at, "alarm re-armed");
            return Ok(Repair::Rearmed);
        }

        let late_by = now.saturating_sub(record.fire_at);
        let due_while_online = record.fire_at >= self.online_since;
        if due_while_online || (self.grace_period_ms > 0 && late_by <= self.grace_period_ms) {
            return match self
                .dispatcher
                .fire_locked(&record.slot_id, &FireOrigin::Recovery)
                .await?
            {
                FireOutcome::Delivered(_) => Ok(Repair::FiredLate),
                FireOutcome::Ignored(_) => Ok(Repair::Untouched),
            };
        }

        self.store.transition(
            &record.slot_id,
            AlarmState::Scheduled,
            AlarmState::Expired,
            now,
        )?;
        tracing::info!(slot_id = %record.slot_id, late_by_ms = late_by, "missed alarm expired");
        Ok(Repair::Expired)
    }

    async fn has_live_timer(&self, record: &AlarmRecord) -> bool {
        let Some(token) = &record.armed_timer_token else {
            return false;
        };
        // An unanswered query counts as dead; a duplicate fire is caught by the token check.
        tokio::time::timeout(self.io_timeout, self.timer.is_live(token))
            .await
            .unwrap_or(false)
    }
}
