//! Orchestrator runtime settings
//!
//! Loaded from an optional YAML file, then overridden by `FLEETD_*`
//! environment variables.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Directory holding configuration snapshots
    pub archive_dir: PathBuf,
    pub health: HealthSettings,
    pub restart: RestartSettings,
    pub process: ProcessSettings,
}

/// Health prober settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Delay between probes of one service
    pub interval_ms: u64,
    /// Timeout of a single probe
    pub timeout_ms: u64,
    /// Consecutive failures before a service is reported unhealthy
    pub failure_threshold: u32,
    /// Probes allowed in flight across the fleet
    pub max_concurrent_probes: usize,
}

/// Restart policy settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    /// Trailing window over which restarts are counted against the budget
    pub window_ms: u64,
    /// How often memory usage is sampled
    pub memory_check_interval_ms: u64,
    /// Restart directives executing at once across the fleet
    pub max_concurrent_restarts: usize,
}

/// Process handling settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSettings {
    /// Output lines retained per process
    pub log_lines: usize,
    /// Delay between readiness probes while a service is starting
    pub readiness_poll_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            archive_dir: default_archive_dir(),
            health: HealthSettings::default(),
            restart: RestartSettings::default(),
            process: ProcessSettings::default(),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 5_000,
            failure_threshold: 3,
            max_concurrent_probes: 16,
        }
    }
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            memory_check_interval_ms: 10_000,
            max_concurrent_restarts: 8,
        }
    }
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            log_lines: 100,
            readiness_poll_interval_ms: 500,
        }
    }
}

/// Default archive location: `~/.fleetd/archive`
pub fn default_archive_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".fleetd")
        .join("archive")
}

impl HealthSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl RestartSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn memory_check_interval(&self) -> Duration {
        Duration::from_millis(self.memory_check_interval_ms)
    }
}

impl ProcessSettings {
    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }
}

impl Settings {
    /// Load settings from a YAML file and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file without environment overrides
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `FLEETD_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("FLEETD_ARCHIVE_DIR") {
            self.archive_dir = PathBuf::from(dir);
        }

        override_value(&lookup, "FLEETD_HEALTH_INTERVAL_MS", &mut self.health.interval_ms)?;
        override_value(&lookup, "FLEETD_HEALTH_TIMEOUT_MS", &mut self.health.timeout_ms)?;
        override_value(
            &lookup,
            "FLEETD_HEALTH_FAILURE_THRESHOLD",
            &mut self.health.failure_threshold,
        )?;
        override_value(
            &lookup,
            "FLEETD_MAX_CONCURRENT_PROBES",
            &mut self.health.max_concurrent_probes,
        )?;
        override_value(&lookup, "FLEETD_RESTART_WINDOW_MS", &mut self.restart.window_ms)?;
        override_value(
            &lookup,
            "FLEETD_MEMORY_CHECK_INTERVAL_MS",
            &mut self.restart.memory_check_interval_ms,
        )?;
        override_value(
            &lookup,
            "FLEETD_MAX_CONCURRENT_RESTARTS",
            &mut self.restart.max_concurrent_restarts,
        )?;
        override_value(&lookup, "FLEETD_LOG_LINES", &mut self.process.log_lines)?;

        Ok(())
    }

    /// Reject settings that would stall the runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid {
            service: "settings".to_string(),
            reason: reason.to_string(),
        };
        if self.health.interval_ms == 0 {
            return Err(invalid("health.interval_ms must be positive"));
        }
        if self.health.timeout_ms == 0 {
            return Err(invalid("health.timeout_ms must be positive"));
        }
        if self.health.failure_threshold == 0 {
            return Err(invalid("health.failure_threshold must be at least 1"));
        }
        if self.health.max_concurrent_probes == 0 {
            return Err(invalid("health.max_concurrent_probes must be at least 1"));
        }
        if self.restart.max_concurrent_restarts == 0 {
            return Err(invalid("restart.max_concurrent_restarts must be at least 1"));
        }
        if self.restart.memory_check_interval_ms == 0 {
            return Err(invalid("restart.memory_check_interval_ms must be positive"));
        }
        if self.process.readiness_poll_interval_ms == 0 {
            return Err(invalid("process.readiness_poll_interval_ms must be positive"));
        }
        Ok(())
    }
}

fn override_value<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::Invalid {
            service: "settings".to_string(),
            reason: format!("{} has invalid value '{}'", key, raw),
        })?;
    }
    Ok(())
}
