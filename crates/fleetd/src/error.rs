//! Orchestrator error taxonomy

use crate::config::ConfigError;
use crate::runtime::{DependencyError, ProbeError, ProcessError, ServiceState};
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Service '{0}' is already registered")]
    DuplicateService(String),

    #[error("Service not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn '{service}': {source}")]
    Spawn {
        service: String,
        #[source]
        source: ProcessError,
    },

    #[error("Service '{service}' did not become ready within {timeout_ms}ms")]
    ReadinessTimeout { service: String, timeout_ms: u64 },

    #[error("Service '{service}' exited before becoming ready: {detail}")]
    EarlyExit { service: String, detail: String },

    #[error("Health probe of '{service}' timed out after {timeout_ms}ms")]
    ProbeTimeout { service: String, timeout_ms: u64 },

    #[error("Health probe of '{service}' failed: {reason}")]
    ProbeFailure { service: String, reason: String },

    #[error("Service '{service}' exhausted its restart budget after {attempts} failures")]
    RestartBudgetExceeded { service: String, attempts: u32 },

    #[error("Failed to write snapshot '{}': {source}", path.display())]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Snapshot '{snapshot}' cannot be restored: {reason}")]
    RestoreValidation { snapshot: String, reason: String },

    #[error("Service '{service}' cannot go from {from} to {to}")]
    InvalidTransition {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },

    #[error("Dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    /// Classify a probe error for a service
    pub fn from_probe(service: &str, error: ProbeError) -> Self {
        match error {
            ProbeError::Timeout(timeout_ms) => OrchestratorError::ProbeTimeout {
                service: service.to_string(),
                timeout_ms,
            },
            other => OrchestratorError::ProbeFailure {
                service: service.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Failures the restart policy may retry on its own
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Spawn { .. }
                | OrchestratorError::ReadinessTimeout { .. }
                | OrchestratorError::EarlyExit { .. }
                | OrchestratorError::ProbeTimeout { .. }
                | OrchestratorError::ProbeFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
