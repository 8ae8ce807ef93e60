//! Application directory paths.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Data (alarm store, logs) | `~/Library/Application Support/reveille/` | `~/.local/share/reveille/` |
//! | Config | `~/Library/Application Support/reveille/` | `~/.config/reveille/` |
//!
//! # Environment Overrides
//!
//! - `REVEILLE_DATA_DIR` overrides [`data_dir`]
//! - `REVEILLE_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root. Holds `alarms.db`, the host lease, and `logs/`.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("REVEILLE_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("reveille"))
        .unwrap_or_else(|| PathBuf::from("/tmp/reveille-data"))
}

/// Application config directory.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("REVEILLE_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("reveille"))
        .unwrap_or_else(|| PathBuf::from("/tmp/reveille-config"))
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}
