//! One-shot wake timers.
//!
//! Timers are the platform seam: on a phone they are OS alarm registrations,
//! in a daemon they are tokio sleeps. Either way the engine only needs to
//! arm, disarm, and ask whether a token is still live. A fired timer is
//! reported as a [`TimerFired`] event carrying the token it was armed with,
//! so stale callbacks can be told apart from the current registration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::clock::Clock;
use super::record::TimerToken;
use crate::error::{AlarmError, Result};

/// A wake timer reached its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired {
    pub slot_id: String,
    pub token: TimerToken,
}

/// Platform timer operations.
#[async_trait]
pub trait WakeTimer: Send + Sync {
    /// Register a one-shot timer for `slot_id` at `fire_at` (epoch millis).
    async fn arm_one_shot(&self, slot_id: &str, fire_at: i64) -> Result<TimerToken>;

    /// Remove a registration. Disarming a fired or unknown token is a no-op.
    async fn disarm(&self, token: &TimerToken) -> Result<()>;

    /// Whether the token still refers to a pending registration.
    async fn is_live(&self, token: &TimerToken) -> bool;
}

fn lock_poisoned(e: impl std::fmt::Display) -> AlarmError {
    AlarmError::SchedulingFailed(format!("timer registry lock poisoned: {e}"))
}

// ---------------------------------------------------------------------------
// Tokio-backed timers
// ---------------------------------------------------------------------------

/// In-process timers backed by tokio tasks.
///
/// Registrations die with the process, which is exactly the failure the
/// recovery pass repairs.
pub struct TokioWakeTimer {
    clock: Arc<dyn Clock>,
    fired_tx: mpsc::UnboundedSender<TimerFired>,
    armed: Arc<Mutex<HashMap<TimerToken, JoinHandle<()>>>>,
}

impl TokioWakeTimer {
    /// Create the timer and the receiver its fires are delivered on.
    pub fn new(clock: Arc<dyn Clock>) -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let timer = Self {
            clock,
            fired_tx,
            armed: Arc::new(Mutex::new(HashMap::new())),
        };
        (timer, fired_rx)
    }

    /// Number of pending registrations.
    pub fn armed_count(&self) -> usize {
        self.armed.lock().map(|armed| armed.len()).unwrap_or_default()
    }
}

#[async_trait]
impl WakeTimer for TokioWakeTimer {
    async fn arm_one_shot(&self, slot_id: &str, fire_at: i64) -> Result<TimerToken> {
        if self.fired_tx.is_closed() {
            return Err(AlarmError::SchedulingFailed(
                "timer fire channel closed".to_owned(),
            ));
        }

        let delay_ms = fire_at.saturating_sub(self.clock.now_millis()).max(0);
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(u64::try_from(delay_ms).unwrap_or_default());
        let token = TimerToken::generate();

        let mut armed = self.armed.lock().map_err(lock_poisoned)?;
        let registry = Arc::clone(&self.armed);
        let tx = self.fired_tx.clone();
        let fired = TimerFired {
            slot_id: slot_id.to_owned(),
            token: token.clone(),
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Ok(mut armed) = registry.lock() {
                armed.remove(&fired.token);
            }
            tracing::debug!(slot_id = %fired.slot_id, "wake timer fired");
            if tx.send(fired).is_err() {
                tracing::warn!("timer fire dropped; receiver closed");
            }
        });
        armed.insert(token.clone(), handle);
        Ok(token)
    }

    async fn disarm(&self, token: &TimerToken) -> Result<()> {
        let handle = self.armed.lock().map_err(lock_poisoned)?.remove(token);
        if let Some(handle) = handle {
            handle.abort();
        }
        Ok(())
    }

    async fn is_live(&self, token: &TimerToken) -> bool {
        self.armed
            .lock()
            .map(|armed| armed.contains_key(token))
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Host-driven timers
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ManualState {
    armed: HashMap<TimerToken, (String, i64)>,
    failing_arms: usize,
    arm_stall: Option<Duration>,
    failing_disarms: usize,
    disarm_stall: Option<Duration>,
}

/// Timers whose fires are pulled by the host.
///
/// A platform shim (or a test) calls [`ManualWakeTimer::pop_due`] when its
/// own clock says so and feeds the results to the dispatcher.
#[derive(Debug, Default)]
pub struct ManualWakeTimer {
    state: Mutex<ManualState>,
}

impl ManualWakeTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` arm attempts fail.
    pub fn fail_next_arms(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_arms = count;
        }
    }

    /// Delay every arm attempt, simulating an unresponsive platform.
    pub fn stall_arms(&self, stall: Option<Duration>) {
        if let Ok(mut state) = self.state.lock() {
            state.arm_stall = stall;
        }
    }

    /// Make the next `count` disarm attempts fail, leaving the registration armed.
    pub fn fail_next_disarms(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_disarms = count;
        }
    }

    /// Delay every disarm attempt.
    pub fn stall_disarms(&self, stall: Option<Duration>) {
        if let Ok(mut state) = self.state.lock() {
            state.disarm_stall = stall;
        }
    }

    /// Remove and return every registration due at `now`, earliest first.
    pub fn pop_due(&self, now: i64) -> Vec<TimerFired> {
        let Ok(mut state) = self.state.lock() else {
            return Vec::new();
        };
        let mut due: Vec<(i64, TimerFired)> = state
            .armed
            .iter()
            .filter(|(_, (_, fire_at))| *fire_at <= now)
            .map(|(token, (slot_id, fire_at))| {
                (
                    *fire_at,
                    TimerFired {
                        slot_id: slot_id.clone(),
                        token: token.clone(),
                    },
                )
            })
            .collect();
        due.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.slot_id.cmp(&b.1.slot_id)));
        for (_, fired) in &due {
            state.armed.remove(&fired.token);
        }
        due.into_iter().map(|(_, fired)| fired).collect()
    }

    /// Drop every registration, as a reboot or process kill would.
    pub fn forget_all(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.armed.clear();
        }
    }

    pub fn armed_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.armed.len())
            .unwrap_or_default()
    }

    /// Fire time of the registration for `slot_id`, if any.
    pub fn armed_fire_at(&self, slot_id: &str) -> Option<i64> {
        let state = self.state.lock().ok()?;
        state
            .armed
            .values()
            .find(|(slot, _)| slot == slot_id)
            .map(|(_, fire_at)| *fire_at)
    }
}

#[async_trait]
impl WakeTimer for ManualWakeTimer {
    async fn arm_one_shot(&self, slot_id: &str, fire_at: i64) -> Result<TimerToken> {
        let stall = self.state.lock().map_err(lock_poisoned)?.arm_stall;
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }

        let mut state = self.state.lock().map_err(lock_poisoned)?;
        if state.failing_arms > 0 {
            state.failing_arms -= 1;
            return Err(AlarmError::SchedulingFailed(format!(
                "platform refused timer for {slot_id}"
            )));
        }
        let token = TimerToken::generate();
        state
            .armed
            .insert(token.clone(), (slot_id.to_owned(), fire_at));
        Ok(token)
    }

    async fn disarm(&self, token: &TimerToken) -> Result<()> {
        let stall = self.state.lock().map_err(lock_poisoned)?.disarm_stall;
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }

        let mut state = self.state.lock().map_err(lock_poisoned)?;
        if state.failing_disarms > 0 {
            state.failing_disarms -= 1;
            return Err(AlarmError::SchedulingFailed(format!(
                "platform did not confirm disarm of {token}"
            )));
        }
        state.armed.remove(token);
        Ok(())
    }

    async fn is_live(&self, token: &TimerToken) -> bool {
        self.state
            .lock()
            .map(|state| state.armed.contains_key(token))
            .unwrap_or(false)
    }
}
