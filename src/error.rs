//! Error types for the alarm engine.

use crate::alarm::record::AlarmState;

/// Top-level error type for alarm scheduling and delivery.
#[derive(Debug, thiserror::Error)]
pub enum AlarmError {
    /// Schedule requested with a fire time that is not strictly in the future.
    #[error("invalid fire time {fire_at} (now is {now})")]
    InvalidFireTime {
        /// Requested fire time, epoch milliseconds.
        fire_at: i64,
        /// Clock reading at the time of the call.
        now: i64,
    },

    /// Slot identifier was empty or otherwise unusable.
    #[error("invalid slot id: {0}")]
    InvalidSlotId(String),

    /// Attempted state change outside the allowed edge set.
    #[error("invalid state transition for {slot_id}: {from} -> {to}")]
    InvalidStateTransition {
        /// Slot whose record rejected the transition.
        slot_id: String,
        /// State the record was actually in.
        from: AlarmState,
        /// State that was requested.
        to: AlarmState,
    },

    /// No record exists for the slot.
    #[error("alarm not found: {0}")]
    NotFound(String),

    /// Durable storage could not be read or written. Retryable.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The wake timer could not be armed. The store was rolled back. Retryable.
    #[error("scheduling failed: {0}")]
    SchedulingFailed(String),

    /// Disarm did not complete; a fire for this slot may still be in flight.
    #[error("cancel not confirmed for {slot_id}: {reason}")]
    CancelInFlight {
        /// Slot being cancelled.
        slot_id: String,
        /// Why the disarm could not be confirmed.
        reason: String,
    },

    /// One record's reconcile step failed; the sweep continued.
    #[error("recovery failed for {slot_id}: {reason}")]
    RecoveryPartialFailure {
        /// Slot whose reconcile step failed.
        slot_id: String,
        /// Underlying failure.
        reason: String,
    },

    /// The presentation layer could not show or dismiss an alarm.
    #[error("presentation failed: {0}")]
    Presentation(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AlarmError {
    /// Whether the caller may retry the same operation later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable(_)
                | Self::SchedulingFailed(_)
                | Self::CancelInFlight { .. }
                | Self::RecoveryPartialFailure { .. }
                | Self::Io(_)
        )
    }
}

impl From<rusqlite::Error> for AlarmError {
    fn from(e: rusqlite::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AlarmError>;
