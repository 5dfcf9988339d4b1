//! fleetd: service orchestration core
//!
//! Keeps a fleet of long-running processes alive:
//! - a registry of service descriptors, the single source of truth
//! - a supervisor driving each service through its lifecycle state machine
//! - periodic HTTP health probes with bounded concurrency
//! - a restart policy with a per-service budget over a trailing window, plus
//!   proactive restarts when a service outgrows its memory limit
//! - atomic, checksummed snapshots of every configuration change
//!
//! # Example Ecosystem File
//!
//! ```yaml
//! version: "1"
//! services:
//!   - name: auth
//!     type: core
//!     criticality: critical
//!     command: node
//!     args: ["dist/server.js"]
//!     working_directory: /srv/auth
//!     environment:
//!       PORT: "6001"
//!     max_memory_bytes: 200M
//!     min_uptime_ms: 10s
//!     max_restarts: 3
//!     restart_delay_ms: 2s
//!     health_endpoint: http://127.0.0.1:6001/health
//!
//!   - name: gateway
//!     type: gateway
//!     criticality: critical
//!     command: node
//!     args: ["dist/gateway.js"]
//!     working_directory: /srv/gateway
//!     dependencies: [auth]
//!     health_endpoint: http://127.0.0.1:6000/health
//! ```

pub mod archive;
pub mod cli;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod runtime;

pub use archive::{ArchiveHandle, Archiver, ConfigSnapshot, SavedServiceState};
pub use cli::FleetArgs;
pub use config::{
    ConfigError, Criticality, EcosystemFile, ExecutionMode, ServiceDescriptor, ServiceStatus,
    ServiceType, Settings,
};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{FleetStatus, Orchestrator, RestoreReport, ServiceStatusReport};
pub use registry::{Registry, ServiceFilter};
pub use runtime::{
    DependencyError, DependencyGraph, DirectiveAction, HealthCheck, HealthEvent, HealthProber,
    HttpHealthCheck, ProbeError, ProcessControl, ProcessError, ProcessExit, RestartDirective,
    RestartPolicyEngine, RestartReason, ServiceEvent, ServiceState, SpawnSpec, SpawnedProcess,
    Supervisor, TokioProcessControl,
};
