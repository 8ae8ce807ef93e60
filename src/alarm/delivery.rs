//! Delivery gate: the until-acknowledged presentation contract.
//!
//! A fired alarm is handed to an [`AlarmPresenter`] and moves to
//! `Delivered`. From there the only way out is [`DeliveryGate::acknowledge`].
//! Nothing else in the crate writes `Acknowledged`, so a presentation layer
//! that loses its window, a relaunch, or a timeout cannot resolve an alarm.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

use super::clock::Clock;
use super::locks::SlotLocks;
use super::record::{AlarmRecord, AlarmState};
use super::store::AlarmStore;
use crate::error::{AlarmError, Result};

/// Seam to whatever shows the alarm to the user.
///
/// Calls are fire-and-forget from the engine's point of view: a failure is
/// logged and never resolves the alarm.
#[async_trait]
pub trait AlarmPresenter: Send + Sync {
    /// Show (or re-show) the alarm.
    async fn present_alarm(&self, slot_id: &str, title: &str) -> Result<()>;

    /// Stop showing the alarm after it was acknowledged.
    async fn dismiss_alarm(&self, slot_id: &str) -> Result<()>;
}

/// Presentation request emitted by [`ChannelPresenter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresentationEvent {
    Present { slot_id: String, title: String },
    Dismiss { slot_id: String },
}

/// Broadcasts presentation requests to any number of UI subscribers.
#[derive(Debug, Clone)]
pub struct ChannelPresenter {
    tx: broadcast::Sender<PresentationEvent>,
}

impl ChannelPresenter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresentationEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: PresentationEvent) -> Result<()> {
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|_| AlarmError::Presentation("no presentation subscribers".to_owned()))
    }
}

#[async_trait]
impl AlarmPresenter for ChannelPresenter {
    async fn present_alarm(&self, slot_id: &str, title: &str) -> Result<()> {
        self.emit(PresentationEvent::Present {
            slot_id: slot_id.to_owned(),
            title: title.to_owned(),
        })
    }

    async fn dismiss_alarm(&self, slot_id: &str) -> Result<()> {
        self.emit(PresentationEvent::Dismiss {
            slot_id: slot_id.to_owned(),
        })
    }
}

/// Presenter that only logs. Useful for headless hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPresenter;

#[async_trait]
impl AlarmPresenter for LogPresenter {
    async fn present_alarm(&self, slot_id: &str, title: &str) -> Result<()> {
        tracing::info!(slot_id, title, "ALARM");
        Ok(())
    }

    async fn dismiss_alarm(&self, slot_id: &str) -> Result<()> {
        tracing::info!(slot_id, "alarm dismissed");
        Ok(())
    }
}

/// Owns the `Firing -> Delivered -> Acknowledged` edges.
pub struct DeliveryGate {
    store: Arc<dyn AlarmStore>,
    presenter: Arc<dyn AlarmPresenter>,
    locks: Arc<SlotLocks>,
    clock: Arc<dyn Clock>,
}

impl DeliveryGate {
    pub fn new(
        store: Arc<dyn AlarmStore>,
        presenter: Arc<dyn AlarmPresenter>,
        locks: Arc<SlotLocks>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            presenter,
            locks,
            clock,
        }
    }

    /// Present the alarm in `slot_id`.
    ///
    /// A `Firing` record is shown and moves to `Delivered`. A `Delivered`
    /// record is shown again without a state change, so a relaunched UI can
    /// call this freely. Every other state is rejected.
    pub async fn present(&self, slot_id: &str) -> Result<AlarmRecord> {
        let _guard = self.locks.lock(slot_id).await;
        let record = self.store.get(slot_id)?;
        self.present_locked(record).await
    }

    /// [`present`](Self::present) for callers already holding the slot lock.
    ///
    /// If the presenter fails the record stays `Firing` and the next
    /// reconcile pass redelivers it.
    pub(crate) async fn present_locked(&self, record: AlarmRecord) -> Result<AlarmRecord> {
        match record.state {
            AlarmState::Firing => {
                if let Err(e) = self
                    .presenter
                    .present_alarm(&record.slot_id, &record.title)
                    .await
                {
                    tracing::warn!(slot_id = %record.slot_id, "presenter failed, alarm stays firing: {e}");
                    return Ok(record);
                }
                let delivered = self.store.transition(
                    &record.slot_id,
                    AlarmState::Firing,
                    AlarmState::Delivered,
                    self.clock.now_millis(),
                )?;
                tracing::info!(slot_id = %delivered.slot_id, "alarm delivered");
                Ok(delivered)
            }
            AlarmState::Delivered => {
                if let Err(e) = self
                    .presenter
                    .present_alarm(&record.slot_id, &record.title)
                    .await
                {
                    tracing::warn!(slot_id = %record.slot_id, "redisplay failed: {e}");
                } else {
                    tracing::debug!(slot_id = %record.slot_id, "alarm redisplayed");
                }
                Ok(record)
            }
            other => Err(AlarmError::InvalidStateTransition {
                slot_id: record.slot_id,
                from: other,
                to: AlarmState::Delivered,
            }),
        }
    }

    /// Resolve a delivered alarm. The only path to `Acknowledged`.
    pub async fn acknowledge(&self, slot_id: &str) -> Result<AlarmRecord> {
        let _guard = self.locks.lock(slot_id).await;
        let record = self.store.transition(
            slot_id,
            AlarmState::Delivered,
            AlarmState::Acknowledged,
            self.clock.now_millis(),
        )?;
        if let Err(e) = self.presenter.dismiss_alarm(slot_id).await {
            tracing::warn!(slot_id, "dismiss hook failed: {e}");
        }
        tracing::info!(slot_id, "alarm acknowledged");
        Ok(record)
    }
}
