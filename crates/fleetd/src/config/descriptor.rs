//! Service descriptor schema definitions

use super::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Service category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Frontend,
    Gateway,
    Core,
    Business,
    Media,
    Ai,
    Utility,
    Infrastructure,
}

/// How critical a service is for the platform as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criticality {
    /// Platform does not work without it
    Critical,
    /// Major features do not work without it
    Important,
    /// Degraded experience only
    Optional,
}

/// Registry status of a service (operator intent, not runtime state)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    #[default]
    Active,
    Disabled,
    Development,
    Deprecated,
}

impl ServiceStatus {
    /// Whether services with this status may be started at all
    pub fn is_startable(&self) -> bool {
        matches!(self, ServiceStatus::Active | ServiceStatus::Development)
    }
}

/// Process execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One process per service
    #[default]
    #[serde(alias = "single")]
    Fork,
    /// The child runs `instance_count` workers behind one supervised process
    #[serde(alias = "clustered")]
    Cluster,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Fork => "fork",
            ExecutionMode::Cluster => "cluster",
        }
    }
}

/// Static description of one managed service.
///
/// Immutable once registered except for `status`, which the registry
/// updates in place. Timing fields accept either milliseconds or unit
/// strings such as `"10s"`; `max_memory_bytes` accepts bytes or `"200M"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique service name
    pub name: String,

    #[serde(rename = "type")]
    pub service_type: ServiceType,

    pub criticality: Criticality,

    #[serde(default)]
    pub status: ServiceStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Executable to run
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    pub working_directory: PathBuf,

    /// Environment overlaid on the orchestrator's own environment
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    #[serde(default = "default_instance_count")]
    pub instance_count: u32,

    #[serde(default)]
    pub execution_mode: ExecutionMode,

    /// Services that must be running before this one starts
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Explicit autostart flag; defaults to `criticality == critical`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autostart: Option<bool>,

    #[serde(
        default,
        deserialize_with = "deserialize_optional_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_memory_bytes: Option<u64>,

    #[serde(default = "default_min_uptime_ms", deserialize_with = "deserialize_millis")]
    pub min_uptime_ms: u64,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    #[serde(default = "default_restart_delay_ms", deserialize_with = "deserialize_millis")]
    pub restart_delay_ms: u64,

    #[serde(
        default = "default_health_grace_period_ms",
        deserialize_with = "deserialize_millis"
    )]
    pub health_grace_period_ms: u64,

    #[serde(
        default = "default_readiness_timeout_ms",
        deserialize_with = "deserialize_millis"
    )]
    pub readiness_timeout_ms: u64,

    #[serde(default = "default_kill_timeout_ms", deserialize_with = "deserialize_millis")]
    pub kill_timeout_ms: u64,

    /// Absolute URL answering `GET` with a success status
    pub health_endpoint: String,
}

fn default_instance_count() -> u32 {
    1
}

fn default_min_uptime_ms() -> u64 {
    10_000
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay_ms() -> u64 {
    2_000
}

fn default_health_grace_period_ms() -> u64 {
    5_000
}

fn default_readiness_timeout_ms() -> u64 {
    10_000
}

fn default_kill_timeout_ms() -> u64 {
    5_000
}

impl ServiceDescriptor {
    /// Create a descriptor with default limits
    pub fn new(
        name: impl Into<String>,
        service_type: ServiceType,
        criticality: Criticality,
        command: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        health_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            service_type,
            criticality,
            status: ServiceStatus::Active,
            description: None,
            tags: Vec::new(),
            command: command.into(),
            args: Vec::new(),
            working_directory: working_directory.into(),
            environment: BTreeMap::new(),
            instance_count: default_instance_count(),
            execution_mode: ExecutionMode::Fork,
            dependencies: Vec::new(),
            autostart: None,
            max_memory_bytes: None,
            min_uptime_ms: default_min_uptime_ms(),
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
            health_grace_period_ms: default_health_grace_period_ms(),
            readiness_timeout_ms: default_readiness_timeout_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
            health_endpoint: health_endpoint.into(),
        }
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn health_grace_period(&self) -> Duration {
        Duration::from_millis(self.health_grace_period_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// Whether the orchestrator starts this service on its own at boot
    pub fn should_autostart(&self) -> bool {
        if !self.status.is_startable() {
            return false;
        }
        self.autostart
            .unwrap_or(self.criticality == Criticality::Critical)
    }

    /// Validate the descriptor fields
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            service: self.name.clone(),
            reason,
        };

        // Validate name: 1-64 chars, alphanumeric + hyphen + underscore
        if self.name.is_empty() || self.name.len() > 64 {
            return Err(invalid(format!(
                "name must be 1-64 characters, got {}",
                self.name.len()
            )));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(invalid("name contains invalid characters".to_string()));
        }

        if self.command.trim().is_empty() {
            return Err(invalid("command cannot be empty".to_string()));
        }

        let mut strings: Vec<&str> = vec![&self.name, &self.command, &self.health_endpoint];
        strings.extend(self.args.iter().map(String::as_str));
        strings.extend(self.environment.iter().flat_map(|(k, v)| [k.as_str(), v.as_str()]));
        strings.extend(self.dependencies.iter().map(String::as_str));
        if let Some(dir) = self.working_directory.to_str() {
            strings.push(dir);
        }
        if strings.iter().any(|s| s.contains('\0')) {
            return Err(invalid("fields cannot contain null bytes".to_string()));
        }

        for key in self.environment.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(invalid(format!("invalid environment variable name '{}'", key)));
            }
        }

        if self.instance_count == 0 {
            return Err(invalid("instance_count must be at least 1".to_string()));
        }
        if self.execution_mode == ExecutionMode::Fork && self.instance_count != 1 {
            return Err(invalid(format!(
                "fork mode runs exactly one instance, got instance_count {}",
                self.instance_count
            )));
        }

        if self.readiness_timeout_ms == 0 {
            return Err(invalid("readiness_timeout_ms must be positive".to_string()));
        }
        if self.kill_timeout_ms == 0 {
            return Err(invalid("kill_timeout_ms must be positive".to_string()));
        }
        if self.max_memory_bytes == Some(0) {
            return Err(invalid("max_memory_bytes must be positive".to_string()));
        }

        let endpoint = self.health_endpoint.as_str();
        let rest = endpoint
            .strip_prefix("http://")
            .or_else(|| endpoint.strip_prefix("https://"));
        match rest {
            Some(host) if !host.is_empty() && !host.starts_with('/') => {}
            _ => {
                return Err(invalid(format!(
                    "health_endpoint must be an absolute http(s) URL, got '{}'",
                    endpoint
                )))
            }
        }

        if self.dependencies.iter().any(|d| d == &self.name) {
            return Err(invalid("a service cannot depend on itself".to_string()));
        }

        Ok(())
    }
}

/// Integer or unit string, as found in ecosystem files
#[derive(Deserialize)]
#[serde(untagged)]
enum UnitValue {
    Int(u64),
    Text(String),
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    match UnitValue::deserialize(deserializer)? {
        UnitValue::Int(ms) => Ok(ms),
        UnitValue::Text(s) => parse_duration_ms(&s).map_err(serde::de::Error::custom),
    }
}

fn deserialize_optional_bytes<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<UnitValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(UnitValue::Int(bytes)) => Ok(Some(bytes)),
        Some(UnitValue::Text(s)) => parse_memory_bytes(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Split "200M" into (200, "M")
fn split_unit(s: &str) -> (&str, &str) {
    let s = s.trim();
    let idx = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    (&s[..idx], s[idx..].trim())
}

/// Parse a duration like `"10s"`, `"500ms"`, `"2m"`, `"1h"` or `"1500"` into milliseconds
pub fn parse_duration_ms(s: &str) -> Result<u64, ConfigError> {
    let (digits, unit) = split_unit(s);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidUnit(s.to_string()))?;
    let factor = match unit.to_ascii_lowercase().as_str() {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" | "min" => 60_000,
        "h" => 3_600_000,
        _ => return Err(ConfigError::InvalidUnit(s.to_string())),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| ConfigError::InvalidUnit(s.to_string()))
}

/// Parse a memory size like `"200M"`, `"1G"`, `"512K"` or `"1048576"` into bytes
pub fn parse_memory_bytes(s: &str) -> Result<u64, ConfigError> {
    let (digits, unit) = split_unit(s);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidUnit(s.to_string()))?;
    let factor: u64 = match unit.to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" => 1 << 10,
        "M" | "MB" => 1 << 20,
        "G" | "GB" => 1 << 30,
        _ => return Err(ConfigError::InvalidUnit(s.to_string())),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| ConfigError::InvalidUnit(s.to_string()))
}
