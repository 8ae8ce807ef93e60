//! Alarm scheduler.
//!
//! Validates fire times, writes records durably, and owns the wake-timer
//! token lifecycle. The ordering for a new alarm is always
//! store write, then arm, then token write: a crash anywhere in between
//! leaves a `Scheduled` record without a live token, which the next
//! reconcile pass re-arms.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::clock::Clock;
use super::locks::SlotLocks;
use super::record::{AlarmRecord, AlarmState, TimerToken};
use super::store::AlarmStore;
use super::timer::WakeTimer;
use crate::error::{AlarmError, Result};

/// Default bound on any single timer platform call.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Label stored when a caller schedules with an empty title.
pub const DEFAULT_TITLE: &str = "Alarm";

/// One entry of a bulk plan (for example, "today's alarms").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSlot {
    pub slot_id: String,
    #[serde(default)]
    pub title: String,
    /// Epoch milliseconds UTC.
    pub fire_at: i64,
}

/// Result of [`AlarmScheduler::schedule_plan`].
#[derive(Debug, Default)]
pub struct PlanOutcome {
    /// Slots now armed.
    pub scheduled: Vec<String>,
    /// Slots whose fire time had already passed.
    pub skipped_past: Vec<String>,
    /// Slots that could not be scheduled, with the reason.
    pub failed: Vec<(String, AlarmError)>,
}

impl PlanOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Schedules, cancels, and reschedules alarms.
pub struct AlarmScheduler {
    store: Arc<dyn AlarmStore>,
    timer: Arc<dyn WakeTimer>,
    clock: Arc<dyn Clock>,
    locks: Arc<SlotLocks>,
    io_timeout: Duration,
    default_title: String,
}

impl AlarmScheduler {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        timer: Arc<dyn WakeTimer>,
        clock: Arc<dyn Clock>,
        locks: Arc<SlotLocks>,
    ) -> Self {
        Self {
            store,
            timer,
            clock,
            locks,
            io_timeout: DEFAULT_IO_TIMEOUT,
            default_title: DEFAULT_TITLE.to_owned(),
        }
    }

    /// Bound on each arm/disarm call.
    #[must_use]
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    #[must_use]
    pub fn with_default_title(mut self, title: impl Into<String>) -> Self {
        self.default_title = title.into();
        self
    }

    /// Schedule `slot_id` to fire at `fire_at` (epoch millis UTC).
    ///
    /// Overwrites a pending or resolved alarm in the same slot. An alarm that
    /// is currently firing or delivered is never overridden. If the timer
    /// cannot be armed the slot is left empty and `SchedulingFailed` is
    /// returned.
    pub async fn schedule(&self, slot_id: &str, title: &str, fire_at: i64) -> Result<AlarmRecord> {
        validate_slot_id(slot_id)?;
        self.validate_fire_at(fire_at)?;
        let _guard = self.locks.lock(slot_id).await;
        self.schedule_locked(slot_id, title, fire_at).await
    }

    /// Cancel a pending alarm.
    ///
    /// Returns `CancelInFlight` if the timer could not be confirmed disarmed;
    /// the record is then left `Scheduled` and the call may be retried.
    pub async fn cancel(&self, slot_id: &str) -> Result<AlarmRecord> {
        validate_slot_id(slot_id)?;
        let _guard = self.locks.lock(slot_id).await;
        self.cancel_locked(slot_id).await
    }

    /// Move a pending alarm to a new fire time, keeping its title.
    ///
    /// The new time is validated first, so a rejected call leaves the alarm
    /// untouched. Fails with `InvalidStateTransition` when the alarm is not
    /// `Scheduled`. If the new timer cannot be armed the slot is left empty,
    /// as with [`schedule`](Self::schedule).
    pub async fn reschedule(&self, slot_id: &str, new_fire_at: i64) -> Result<AlarmRecord> {
        validate_slot_id(slot_id)?;
        self.validate_fire_at(new_fire_at)?;
        let _guard = self.locks.lock(slot_id).await;
        let cancelled = self.cancel_locked(slot_id).await?;
        self.schedule_locked(slot_id, &cancelled.title, new_fire_at)
            .await
    }

    pub fn list_all(&self) -> Result<Vec<AlarmRecord>> {
        self.store.list_all()
    }

    pub fn get(&self, slot_id: &str) -> Result<AlarmRecord> {
        self.store.get(slot_id)
    }

    /// Schedule every future slot of `plan`. Past slots are skipped and
    /// per-slot failures are collected without stopping the run.
    pub async fn schedule_plan(&self, plan: &[PlanSlot]) -> PlanOutcome {
        let mut outcome = PlanOutcome::default();
        for slot in plan {
            if slot.fire_at <= self.clock.now_millis() {
                tracing::debug!(slot_id = %slot.slot_id, "plan slot already past, skipping");
                outcome.skipped_past.push(slot.slot_id.clone());
                continue;
            }
            match self.schedule(&slot.slot_id, &slot.title, slot.fire_at).await {
                Ok(_) => outcome.scheduled.push(slot.slot_id.clone()),
                Err(e) => {
                    tracing::warn!(slot_id = %slot.slot_id, "plan slot failed: {e}");
                    outcome.failed.push((slot.slot_id.clone(), e));
                }
            }
        }
        tracing::info!(
            scheduled = outcome.scheduled.len(),
            skipped = outcome.skipped_past.len(),
            failed = outcome.failed.len(),
            "alarm plan applied"
        );
        outcome
    }

    async fn schedule_locked(&self, slot_id: &str, title: &str, fire_at: i64) -> Result<AlarmRecord> {
        // Time may have moved while waiting for the lock.
        let now = self.validate_fire_at(fire_at)?;

        match self.store.get(slot_id) {
            Ok(existing) if existing.state.is_in_flight() => {
                return Err(AlarmError::InvalidStateTransition {
                    slot_id: slot_id.to_owned(),
                    from: existing.state,
                    to: AlarmState::Scheduled,
                });
            }
            Ok(existing) => {
                if let Some(token) = &existing.armed_timer_token {
                    // A stale fire is still caught by the dispatcher's token check.
                    if let Err(e) = self.disarm(slot_id, token).await {
                        tracing::warn!(slot_id, "could not disarm replaced timer: {e}");
                    }
                }
            }
            Err(AlarmError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let title = if title.trim().is_empty() {
            self.default_title.as_str()
        } else {
            title
        };
        let mut record = AlarmRecord::scheduled(slot_id, title, fire_at, now);
        self.store.put(&record)?;

        match self.arm(&record).await {
            Ok(token) => {
                record.armed_timer_token = Some(token);
                tracing::info!(slot_id, fire_at, "alarm scheduled");
                Ok(record)
            }
            Err(e) => {
                if let Err(remove_err) = self.store.remove(slot_id) {
                    tracing::error!(slot_id, "compensating remove failed: {remove_err}");
                }
                Err(e)
            }
        }
    }

    async fn cancel_locked(&self, slot_id: &str) -> Result<AlarmRecord> {
        let record = self.store.get(slot_id)?;
        if record.state != AlarmState::Scheduled {
            return Err(AlarmError::InvalidStateTransition {
                slot_id: slot_id.to_owned(),
                from: record.state,
                to: AlarmState::Cancelled,
            });
        }
        if let Some(token) = &record.armed_timer_token {
            self.disarm(slot_id, token).await?;
        }
        let cancelled = self.store.transition(
            slot_id,
            AlarmState::Scheduled,
            AlarmState::Cancelled,
            self.clock.now_millis(),
        )?;
        tracing::info!(slot_id, "alarm cancelled");
        Ok(cancelled)
    }

    /// Arm a timer for a `Scheduled` record and persist its token.
    ///
    /// Shared with the recovery pass. The caller must hold the slot lock.
    pub(crate) async fn arm(&self, record: &AlarmRecord) -> Result<TimerToken> {
        let armed = tokio::time::timeout(
            self.io_timeout,
            self.timer.arm_one_shot(&record.slot_id, record.fire_at),
        )
        .await;
        let token = match armed {
            Ok(Ok(token)) => token,
            Ok(Err(e @ AlarmError::SchedulingFailed(_))) => return Err(e),
            Ok(Err(e)) => return Err(AlarmError::SchedulingFailed(e.to_string())),
            Err(_) => {
                return Err(AlarmError::SchedulingFailed(format!(
                    "arming timed out after {}ms",
                    self.io_timeout.as_millis()
                )));
            }
        };

        if let Err(e) = self.store.set_timer_token(&record.slot_id, &token) {
            // An unrecorded timer would fire with a token nobody recognizes.
            if let Err(disarm_err) = self.disarm(&record.slot_id, &token).await {
                tracing::warn!(slot_id = %record.slot_id, "orphan timer left armed: {disarm_err}");
            }
            return Err(e);
        }
        tracing::debug!(slot_id = %record.slot_id, token = %token, "wake timer armed");
        Ok(token)
    }

    async fn disarm(&self, slot_id: &str, token: &TimerToken) -> Result<()> {
        match tokio::time::timeout(self.io_timeout, self.timer.disarm(token)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AlarmError::CancelInFlight {
                slot_id: slot_id.to_owned(),
                reason: e.to_string(),
            }),
            Err(_) => Err(AlarmError::CancelInFlight {
                slot_id: slot_id.to_owned(),
                reason: format!("disarm timed out after {}ms", self.io_timeout.as_millis()),
            }),
        }
    }

    fn validate_fire_at(&self, fire_at: i64) -> Result<i64> {
        let now = self.clock.now_millis();
        if fire_at <= now {
            return Err(AlarmError::InvalidFireTime { fire_at, now });
        }
        Ok(now)
    }
}

fn validate_slot_id(slot_id: &str) -> Result<()> {
    if slot_id.trim().is_empty() {
        return Err(AlarmError::InvalidSlotId("slot id must not be empty".to_owned()));
    }
    Ok(())
}
