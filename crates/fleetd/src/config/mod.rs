//! Service descriptors, ecosystem files and orchestrator settings

mod descriptor;
mod ecosystem;
mod settings;

pub use descriptor::*;
pub use ecosystem::*;
pub use settings::*;

/// Errors that can occur when loading or validating configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration for '{service}': {reason}")]
    Invalid { service: String, reason: String },

    #[error("Invalid unit value: '{0}'")]
    InvalidUnit(String),
}
