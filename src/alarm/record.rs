//! Alarm record and its state machine.
//!
//! Defines [`AlarmRecord`], the [`AlarmState`] lifecycle, and the
//! [`TimerToken`] handle that ties a record to its armed wake timer.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AlarmError, Result};

/// Lifecycle state of one alarm slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    /// Persisted and waiting for its wake timer.
    Scheduled,
    /// Fire accepted; delivery in progress.
    Firing,
    /// Handed to the presentation layer; waiting for acknowledgment.
    Delivered,
    /// Resolved by an explicit user acknowledgment.
    Acknowledged,
    /// Cancelled by the caller before it fired.
    Cancelled,
    /// Missed while the process was down; never delivered.
    Expired,
}

impl AlarmState {
    /// Whether `self -> next` is one of the allowed edges.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Scheduled, Self::Firing)
                | (Self::Firing, Self::Delivered)
                | (Self::Delivered, Self::Acknowledged)
                | (Self::Scheduled, Self::Cancelled)
                | (Self::Scheduled, Self::Expired)
        )
    }

    /// Resolved states. Records in these states are eligible for cleanup.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acknowledged | Self::Cancelled | Self::Expired)
    }

    /// Fired but not yet acknowledged.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Firing | Self::Delivered)
    }

    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Firing => "firing",
            Self::Delivered => "delivered",
            Self::Acknowledged => "acknowledged",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(Self::Scheduled),
            "firing" => Some(Self::Firing),
            "delivered" => Some(Self::Delivered),
            "acknowledged" => Some(Self::Acknowledged),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Opaque handle to an armed wake timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerToken(String);

impl TimerToken {
    /// Fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap a token string produced by a platform timer.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw token string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One scheduled alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlarmRecord {
    /// Caller-assigned slot identity.
    pub slot_id: String,
    /// Display label.
    pub title: String,
    /// Absolute fire time, epoch milliseconds UTC.
    pub fire_at: i64,
    /// Current lifecycle state.
    pub state: AlarmState,
    /// Armed wake timer. Present only while `Scheduled`.
    pub armed_timer_token: Option<TimerToken>,
    /// Epoch milliseconds when the record was written.
    pub created_at: i64,
    /// Epoch milliseconds of the last state change.
    pub last_transition_at: i64,
}

impl AlarmRecord {
    /// New unarmed `Scheduled` record.
    pub fn scheduled(
        slot_id: impl Into<String>,
        title: impl Into<String>,
        fire_at: i64,
        now: i64,
    ) -> Self {
        Self {
            slot_id: slot_id.into(),
            title: title.into(),
            fire_at,
            state: AlarmState::Scheduled,
            armed_timer_token: None,
            created_at: now,
            last_transition_at: now,
        }
    }

    /// Apply `self.state -> next`, clearing the timer token when leaving
    /// `Scheduled`. The record is untouched on error.
    pub fn transition(&mut self, next: AlarmState, at: i64) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(AlarmError::InvalidStateTransition {
                slot_id: self.slot_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.last_transition_at = at;
        if next != AlarmState::Scheduled {
            self.armed_timer_token = None;
        }
        Ok(())
    }
}
