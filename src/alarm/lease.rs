//! File-backed host lease.
//!
//! Wake timers live in whichever process armed them. The long-running host
//! holds a lease in the data directory so short-lived writers can tell that
//! their timers would die with them and hand the change to the host instead.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AlarmError, Result};

/// Lease file name inside the data directory.
pub const LEASE_FILENAME: &str = "host.lease";

/// Lease timing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostLeaseConfig {
    /// How long a lease stays valid without renewal.
    pub ttl: Duration,
    /// Expected renewal interval.
    pub heartbeat: Duration,
}

impl Default for HostLeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            heartbeat: Duration::from_secs(5),
        }
    }
}

/// Who holds the lease, as written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseHolder {
    pub instance_id: String,
    pub pid: u32,
    pub started_at: i64,
    pub heartbeat_at: i64,
    pub expires_at: i64,
}

/// Result of an acquire or renew attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// This instance holds the lease.
    Acquired {
        /// `true` when an expired holder was replaced.
        takeover: bool,
    },
    /// A live peer holds the lease.
    HeldElsewhere(LeaseHolder),
}

/// One host instance's handle on the lease file.
pub struct HostLease {
    instance_id: String,
    pid: u32,
    path: PathBuf,
    config: HostLeaseConfig,
}

impl HostLease {
    /// Lease handle for the store in `data_dir`.
    #[must_use]
    pub fn new(data_dir: &Path, config: HostLeaseConfig) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            path: data_dir.join(LEASE_FILENAME),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn heartbeat(&self) -> Duration {
        self.config.heartbeat
    }

    /// Acquire the lease, or renew it if this instance already holds it.
    pub fn try_acquire_or_renew_at(&self, now_ms: i64) -> Result<LeaseDecision> {
        let ttl_ms = i64::try_from(self.config.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_ms.saturating_add(ttl_ms);

        match read_holder(&self.path)? {
            None => {
                self.write(now_ms, now_ms, expires_at)?;
                Ok(LeaseDecision::Acquired { takeover: false })
            }
            Some(current) if current.instance_id == self.instance_id => {
                self.write(current.started_at, now_ms, expires_at)?;
                Ok(LeaseDecision::Acquired { takeover: false })
            }
            Some(current) if current.expires_at <= now_ms => {
                tracing::warn!(
                    previous_pid = current.pid,
                    "taking over expired host lease"
                );
                self.write(now_ms, now_ms, expires_at)?;
                Ok(LeaseDecision::Acquired { takeover: true })
            }
            Some(current) => Ok(LeaseDecision::HeldElsewhere(current)),
        }
    }

    /// Give the lease up. A lease held by someone else is left alone.
    pub fn release(&self) -> Result<()> {
        match read_holder(&self.path)? {
            Some(current) if current.instance_id == self.instance_id => {
                std::fs::remove_file(&self.path)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn write(&self, started_at: i64, heartbeat_at: i64, expires_at: i64) -> Result<()> {
        let holder = LeaseHolder {
            instance_id: self.instance_id.clone(),
            pid: self.pid,
            started_at,
            heartbeat_at,
            expires_at,
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(&holder)
            .map_err(|e| AlarmError::StorageUnavailable(format!("serialize host lease: {e}")))?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

/// The live holder of the lease in `data_dir`, if any.
pub fn active_holder(data_dir: &Path, now_ms: i64) -> Result<Option<LeaseHolder>> {
    Ok(read_holder(&data_dir.join(LEASE_FILENAME))?.filter(|holder| holder.expires_at > now_ms))
}

fn read_holder(path: &Path) -> Result<Option<LeaseHolder>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(holder) => Ok(Some(holder)),
        Err(e) => {
            tracing::warn!("ignoring malformed host lease at {}: {e}", path.display());
            Ok(None)
        }
    }
}
