//! Service lifecycle state machine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a supervised service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Stopped,
    /// Spawned, waiting for readiness
    Starting,
    Running,
    /// Graceful termination in progress
    Stopping,
    /// Readiness was not reached in time
    Failed,
    /// Process exited while it was expected to run
    Crashed,
    /// Health probes report sustained failure
    Unhealthy,
    /// A restart directive is being executed
    Restarting,
    /// Restart budget exhausted; only an operator can revive it
    PermanentlyFailed,
}

impl ServiceState {
    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Crashed)
                | (Running, Unhealthy)
                | (Stopping, Stopped)
                | (Unhealthy, Restarting)
                | (Unhealthy, Running)
                | (Unhealthy, Stopping)
                | (Unhealthy, Crashed)
                | (Unhealthy, PermanentlyFailed)
                | (Crashed, Restarting)
                | (Crashed, PermanentlyFailed)
                | (Crashed, Stopping)
                | (Failed, Restarting)
                | (Failed, Starting)
                | (Failed, PermanentlyFailed)
                | (Failed, Stopping)
                | (Restarting, Starting)
                | (Restarting, Stopping)
                | (PermanentlyFailed, Starting)
                | (PermanentlyFailed, Stopping)
        )
    }

    /// A live process is expected in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServiceState::Starting | ServiceState::Running | ServiceState::Unhealthy
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Failed => "failed",
            ServiceState::Crashed => "crashed",
            ServiceState::Unhealthy => "unhealthy",
            ServiceState::Restarting => "restarting",
            ServiceState::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle transition, broadcast by the supervisor after it happened
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceEvent {
    pub service: String,
    pub from: ServiceState,
    pub to: ServiceState,
    /// Time since the last `Starting -> Running` transition, if the
    /// service had reached `Running` in its current generation
    #[serde(skip)]
    pub uptime: Option<Duration>,
    /// Human readable cause (exit code, probe error, directive reason)
    pub detail: Option<String>,
}

impl ServiceEvent {
    pub fn new(service: impl Into<String>, from: ServiceState, to: ServiceState) -> Self {
        Self {
            service: service.into(),
            from,
            to,
            uptime: None,
            detail: None,
        }
    }

    pub fn with_uptime(mut self, uptime: Option<Duration>) -> Self {
        self.uptime = uptime;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
