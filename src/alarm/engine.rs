//! Engine wiring.
//!
//! [`AlarmEngine`] owns one instance of each component, the recovery
//! barrier, and the task that turns timer fires into dispatches.
//!
//! ```rust,ignore
//! let presenter = Arc::new(ChannelPresenter::new(64));
//! let (engine, fired_rx) = AlarmEngine::open(&config, presenter.clone())?;
//! engine.start().await?;          // reconcile, then accept triggers
//! let pump = engine.spawn_fire_pump(fired_rx);
//! engine.schedule("wake", "Wake up", fire_at).await?;
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::clock::{Clock, SystemClock};
use super::delivery::{AlarmPresenter, DeliveryGate};
use super::dispatcher::{FireOrigin, FireOutcome, RecoveryBarrier, TriggerDispatcher};
use super::locks::SlotLocks;
use super::record::AlarmRecord;
use super::recovery::{ReconcileReport, RecoveryCoordinator};
use super::scheduler::{AlarmScheduler, PlanOutcome, PlanSlot};
use super::store::{AlarmAuditEntry, AlarmStore, SqliteAlarmStore};
use super::timer::{TimerFired, TokioWakeTimer, WakeTimer};
use crate::config::ReveilleConfig;
use crate::error::Result;

/// The assembled alarm engine.
pub struct AlarmEngine {
    store: Arc<dyn AlarmStore>,
    scheduler: Arc<AlarmScheduler>,
    dispatcher: Arc<TriggerDispatcher>,
    gate: Arc<DeliveryGate>,
    recovery: Arc<RecoveryCoordinator>,
    barrier: RecoveryBarrier,
    cancel: CancellationToken,
}

impl AlarmEngine {
    /// Assemble an engine from explicit parts.
    pub fn new(
        config: &ReveilleConfig,
        store: Arc<dyn AlarmStore>,
        timer: Arc<dyn WakeTimer>,
        presenter: Arc<dyn AlarmPresenter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = Arc::new(SlotLocks::new());
        let barrier = RecoveryBarrier::new();
        let io_timeout = config.store.io_timeout();

        let scheduler = Arc::new(
            AlarmScheduler::new(
                Arc::clone(&store),
                Arc::clone(&timer),
                Arc::clone(&clock),
                Arc::clone(&locks),
            )
            .with_io_timeout(io_timeout)
            .with_default_title(config.alarm.default_title.clone()),
        );
        let gate = Arc::new(DeliveryGate::new(
            Arc::clone(&store),
            presenter,
            Arc::clone(&locks),
            Arc::clone(&clock),
        ));
        let dispatcher = Arc::new(TriggerDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&gate),
            Arc::clone(&locks),
            Arc::clone(&clock),
            barrier.clone(),
        ));
        let recovery = Arc::new(
            RecoveryCoordinator::new(
                Arc::clone(&store),
                timer,
                Arc::clone(&scheduler),
                Arc::clone(&dispatcher),
                Arc::clone(&gate),
                locks,
                clock,
            )
            .with_grace_period(config.recovery.grace_period())
            .with_purge_resolved(config.recovery.purge_resolved)
            .with_io_timeout(io_timeout),
        );

        Self {
            store,
            scheduler,
            dispatcher,
            gate,
            recovery,
            barrier,
            cancel: CancellationToken::new(),
        }
    }

    /// Open the on-disk store and in-process timers described by `config`.
    ///
    /// Returns the receiver to pass to [`spawn_fire_pump`](Self::spawn_fire_pump).
    pub fn open(
        config: &ReveilleConfig,
        presenter: Arc<dyn AlarmPresenter>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TimerFired>)> {
        config.validate()?;
        let store = SqliteAlarmStore::open(
            &config.store.resolved_data_dir(),
            config.store.io_timeout(),
        )?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let (timer, fired_rx) = TokioWakeTimer::new(Arc::clone(&clock));
        let engine = Self::new(config, Arc::new(store), Arc::new(timer), presenter, clock);
        Ok((engine, fired_rx))
    }

    /// Process-restart entry point.
    ///
    /// Runs one reconcile pass and then opens the barrier so live triggers
    /// start flowing. The barrier opens even if the pass fails, so a broken
    /// store cannot wedge every trigger forever.
    pub async fn start(&self) -> Result<ReconcileReport> {
        let result = self.recovery.reconcile().await;
        self.barrier.open();
        match &result {
            Ok(report) if report.is_clean() => tracing::info!("alarm engine ready"),
            Ok(report) => tracing::warn!(
                failures = report.failures.len(),
                "alarm engine ready with unrepaired records"
            ),
            Err(e) => tracing::error!("startup reconcile failed: {e}"),
        }
        result
    }

    /// Platform boot-completed notification. Re-runs reconcile.
    pub async fn on_boot_completed(&self) -> Result<ReconcileReport> {
        tracing::info!("boot completed, reconciling alarms");
        self.recovery.reconcile().await
    }

    /// Whether [`start`](Self::start) has released live triggers.
    pub fn is_ready(&self) -> bool {
        self.barrier.is_open()
    }

    /// Spawn the task that dispatches timer fires until shutdown.
    ///
    /// Each fire runs on its own task so a slow presenter on one slot never
    /// delays another.
    pub fn spawn_fire_pump(&self, mut fired_rx: mpsc::UnboundedReceiver<TimerFired>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tracing::debug!("fire pump started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("fire pump cancelled");
                        break;
                    }
                    fired = fired_rx.recv() => {
                        let Some(TimerFired { slot_id, token }) = fired else {
                            tracing::debug!("timer channel closed, fire pump stopping");
                            break;
                        };
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            match dispatcher.on_fire(&slot_id, FireOrigin::Timer(token)).await {
                                Ok(FireOutcome::Delivered(_)) => {}
                                Ok(FireOutcome::Ignored(reason)) => {
                                    tracing::debug!(slot_id = %slot_id, ?reason, "timer fire ignored");
                                }
                                Err(e) => {
                                    tracing::error!(slot_id = %slot_id, "timer fire failed: {e}");
                                }
                            }
                        });
                    }
                }
            }
        })
    }

    /// Stop the fire pump.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn schedule(&self, slot_id: &str, title: &str, fire_at: i64) -> Result<AlarmRecord> {
        self.scheduler.schedule(slot_id, title, fire_at).await
    }

    pub async fn cancel(&self, slot_id: &str) -> Result<AlarmRecord> {
        self.scheduler.cancel(slot_id).await
    }

    pub async fn reschedule(&self, slot_id: &str, new_fire_at: i64) -> Result<AlarmRecord> {
        self.scheduler.reschedule(slot_id, new_fire_at).await
    }

    pub async fn schedule_plan(&self, plan: &[PlanSlot]) -> PlanOutcome {
        self.scheduler.schedule_plan(plan).await
    }

    pub fn list_all(&self) -> Result<Vec<AlarmRecord>> {
        self.scheduler.list_all()
    }

    pub fn get(&self, slot_id: &str) -> Result<AlarmRecord> {
        self.scheduler.get(slot_id)
    }

    pub fn history(&self, slot_id: &str) -> Result<Vec<AlarmAuditEntry>> {
        self.store.history(slot_id)
    }

    /// Trigger entry point for hosts that deliver fires themselves.
    pub async fn on_fire(&self, slot_id: &str, origin: FireOrigin) -> Result<FireOutcome> {
        self.dispatcher.on_fire(slot_id, origin).await
    }

    /// Re-show a firing or delivered alarm, e.g. after the UI was recreated.
    pub async fn present(&self, slot_id: &str) -> Result<AlarmRecord> {
        self.gate.present(slot_id).await
    }

    /// Explicit user acknowledgment from the presentation layer.
    pub async fn acknowledge(&self, slot_id: &str) -> Result<AlarmRecord> {
        self.gate.acknowledge(slot_id).await
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.recovery.reconcile().await
    }

    pub async fn purge_resolved(&self) -> Result<Vec<String>> {
        self.recovery.purge_resolved().await
    }
}

impl Drop for AlarmEngine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
