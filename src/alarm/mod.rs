//! Alarm scheduling, persistence, and delivery.
//!
//! A record moves through
//! `Scheduled -> Firing -> Delivered -> Acknowledged`, or leaves `Scheduled`
//! for `Cancelled` / `Expired`. [`AlarmEngine`] wires the pieces together;
//! the individual components are public so hosts with their own runtime
//! layout can assemble them directly.

pub mod clock;
pub mod delivery;
pub mod dispatcher;
pub mod engine;
pub mod lease;
pub mod locks;
pub mod record;
pub mod recovery;
mod schema;
pub mod scheduler;
pub mod store;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{AlarmPresenter, ChannelPresenter, DeliveryGate, LogPresenter, PresentationEvent};
pub use dispatcher::{FireOrigin, FireOutcome, IgnoreReason, RecoveryBarrier, TriggerDispatcher};
pub use engine::AlarmEngine;
pub use lease::{HostLease, HostLeaseConfig, LeaseDecision, LeaseHolder, active_holder};
pub use locks::SlotLocks;
pub use record::{AlarmRecord, AlarmState, TimerToken};
pub use recovery::{ReconcileReport, RecoveryCoordinator};
pub use scheduler::{AlarmScheduler, DEFAULT_TITLE, PlanOutcome, PlanSlot};
pub use store::{AlarmAuditEntry, AlarmStore, DB_FILENAME, SqliteAlarmStore};
pub use timer::{ManualWakeTimer, TimerFired, TokioWakeTimer, WakeTimer};
