//! Ecosystem file: the declarative list of managed services

use super::{ConfigError, ServiceDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Root ecosystem file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcosystemFile {
    /// Ecosystem format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Service descriptors
    pub services: Vec<ServiceDescriptor>,
}

fn default_version() -> String {
    "1".to_string()
}

impl EcosystemFile {
    pub fn new(services: Vec<ServiceDescriptor>) -> Self {
        Self {
            version: default_version(),
            services,
        }
    }

    /// Load an ecosystem file; `.json` files are parsed as JSON, anything else as YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    /// Parse an ecosystem file from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let file: EcosystemFile =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    /// Parse an ecosystem file from a JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let file: EcosystemFile =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        file.validate()?;
        Ok(file)
    }

    /// Validate every descriptor and the uniqueness of names
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for service in &self.services {
            service.validate()?;
            if !seen.insert(service.name.as_str()) {
                return Err(ConfigError::Invalid {
                    service: service.name.clone(),
                    reason: "service is declared more than once".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Serialize as YAML
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Write the ecosystem file, choosing the format from the extension
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        let content = if is_json {
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            self.to_yaml()?
        };
        std::fs::write(path, content).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })
    }
}
