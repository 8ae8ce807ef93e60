//! Reveille: durable alarm scheduling with an until-acknowledged delivery
//! guarantee.
//!
//! Alarms are written to SQLite before a wake timer is armed, re-armed after
//! a process kill or reboot, fired at most once per schedule, and stay on
//! screen until the user explicitly acknowledges them.
//!
//! # Architecture
//!
//! - **AlarmStore**: crash-safe record per slot, compare-and-swap state changes
//! - **AlarmScheduler**: validates fire times, owns timer tokens
//! - **TriggerDispatcher**: timer, boot, and recovery triggers funnel here
//! - **DeliveryGate**: `Delivered` resolves only through `acknowledge`
//! - **RecoveryCoordinator**: startup reconcile of store against live timers
//! - **AlarmEngine**: wires the above and pumps timer fires

pub mod alarm;
pub mod config;
pub mod error;
pub mod reveille_dirs;

pub use alarm::{
    AlarmEngine, AlarmPresenter, AlarmRecord, AlarmState, ChannelPresenter, FireOrigin,
    FireOutcome, PlanSlot, PresentationEvent, ReconcileReport,
};
pub use config::ReveilleConfig;
pub use error::{AlarmError, Result};
