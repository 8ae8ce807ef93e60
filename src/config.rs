//! Configuration types for the alarm engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AlarmError, Result};

/// Top-level configuration, loaded from `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReveilleConfig {
    /// Durable store settings.
    pub store: StoreConfig,
    /// Startup reconciliation settings.
    pub recovery: RecoveryConfig,
    /// Alarm defaults.
    pub alarm: AlarmConfig,
    /// Log output settings.
    pub logging: LoggingConfig,
}

/// Alarm store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding `alarms.db` (None = platform data dir).
    pub data_dir: Option<PathBuf>,
    /// Upper bound in ms on any single storage or timer platform call.
    pub io_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            io_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Configured data dir, falling back to [`crate::reveille_dirs::data_dir`].
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(crate::reveille_dirs::data_dir)
    }

    /// Rolling log directory, `logs/` under the resolved data dir.
    pub fn logs_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("logs")
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Recovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// How late (ms) a missed alarm may still fire during reconcile.
    ///
    /// 0 means missed alarms always expire without ringing.
    pub grace_period_ms: u64,
    /// Remove acknowledged, cancelled and expired records during reconcile.
    pub purge_resolved: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 0,
            purge_resolved: true,
        }
    }
}

impl RecoveryConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Alarm defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
    /// Label used when an alarm is scheduled with an empty title.
    pub default_title: String,
    /// Buffered presentation events per subscriber.
    pub presentation_buffer: usize,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            default_title: crate::alarm::DEFAULT_TITLE.to_owned(),
            presentation_buffer: 64,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub filter: String,
    /// Also write a daily rolling log under the logs directory.
    pub to_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "reveille=info".to_owned(),
            to_file: false,
        }
    }
}

impl ReveilleConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| AlarmError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise defaults.
    pub fn load_or_default(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| AlarmError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> PathBuf {
        crate::reveille_dirs::config_file()
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.io_timeout_ms == 0 {
            return Err(AlarmError::Config(
                "store.io_timeout_ms must be greater than zero".to_owned(),
            ));
        }
        if self.alarm.default_title.trim().is_empty() {
            return Err(AlarmError::Config(
                "alarm.default_title must not be empty".to_owned(),
            ));
        }
        if self.alarm.presentation_buffer == 0 {
            return Err(AlarmError::Config(
                "alarm.presentation_buffer must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}
