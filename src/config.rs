//! Configuration types for the scheduler and wake lock coordinator.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, WakefulError};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakefulConfig {
    /// Scheduler engine settings.
    pub scheduler: SchedulerConfig,
    /// Wake lock coordinator settings.
    pub wake_lock: WakeLockConfig,
}

/// Scheduler engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Spacing of backstop alarms in seconds.
    ///
    /// The backstop bounds how late a task can run when the local timer was
    /// lost to suspension. Fifteen minutes matches what idle-exempt OS
    /// alarms are allowed to fire at.
    pub backstop_interval_secs: u64,
    /// Request exact-while-idle alarms when the facility supports them,
    /// instead of inexact repeating ones.
    pub prefer_exact_alarm: bool,
    /// Minimum number of cancelled entries before the task queue is
    /// compacted.
    pub compaction_threshold: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backstop_interval_secs: 15 * 60,
            prefer_exact_alarm: true,
            compaction_threshold: 64,
        }
    }
}

impl SchedulerConfig {
    /// Backstop alarm spacing as a [`Duration`].
    pub fn backstop_interval(&self) -> Duration {
        Duration::from_secs(self.backstop_interval_secs)
    }
}

/// Wake lock coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeLockConfig {
    /// Label given to the underlying OS lock.
    pub tag: String,
    /// How often the OS lock is renewed while held, in seconds.
    pub lock_duration_secs: u64,
    /// Extra lifetime given to each OS lock request beyond the renewal
    /// period, in seconds. If renewal stops, the OS drops the lock this long
    /// after it was due to be replaced.
    pub safety_margin_secs: u64,
}

impl Default for WakeLockConfig {
    fn default() -> Self {
        Self {
            tag: "wakeful".to_owned(),
            lock_duration_secs: 60,
            safety_margin_secs: 30,
        }
    }
}

impl WakeLockConfig {
    /// Renewal period as a [`Duration`].
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    /// Safety margin as a [`Duration`].
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }
}

impl WakefulConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| WakefulError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
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
            toml::to_string_pretty(self).map_err(|e| WakefulError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/wakeful/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("wakeful").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("wakeful")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/wakeful-config/config.toml")
        }
    }

    /// Reject values the scheduler cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`WakefulError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.backstop_interval_secs == 0 {
            return Err(WakefulError::Config(
                "scheduler.backstop_interval_secs must be positive".to_owned(),
            ));
        }
        if self.wake_lock.lock_duration_secs == 0 {
            return Err(WakefulError::Config(
                "wake_lock.lock_duration_secs must be positive".to_owned(),
            ));
        }
        if self.wake_lock.tag.trim().is_empty() {
            return Err(WakefulError::Config(
                "wake_lock.tag must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}
