//! Lifecycle Scenarios
//!
//! Startup ordering, readiness, graceful and forced stops, and shutdown of
//! the whole fleet.

mod common;

use common::*;
use fleetd::{
    Criticality, DependencyError, EcosystemFile, OrchestratorError, ServiceState, ServiceStatus,
};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(3);

fn with_dependencies(name: &str, dependencies: &[&str]) -> fleetd::ServiceDescriptor {
    let mut descriptor = service(name);
    descriptor.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
    descriptor
}

#[tokio::test]
async fn test_start_all_follows_dependency_order() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;

    let mut media = with_dependencies("media", &["db"]);
    media.criticality = Criticality::Optional;
    let ecosystem = EcosystemFile::new(vec![
        with_dependencies("gateway", &["auth"]),
        with_dependencies("auth", &["db"]),
        service("db"),
        media,
    ]);
    orch.load(ecosystem).await.unwrap();

    let mut events = orch.subscribe();
    let fleet_status = orch.start_all().await.unwrap();
    assert_eq!(fleet_status.total, 4);
    assert_eq!(fleet_status.running, 3);

    let started: Vec<String> = drain(&mut events)
        .into_iter()
        .filter(|e| e.to == ServiceState::Running)
        .map(|e| e.service)
        .collect();
    assert_eq!(started, vec!["db", "auth", "gateway"]);
    assert_eq!(orch.supervisor().state("media").await, ServiceState::Stopped);
}

#[tokio::test]
async fn test_failed_dependency_blocks_dependents() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    let mut db = service("db");
    db.restart_delay_ms = 10_000;
    orch.register(db).await.unwrap();
    orch.register(with_dependencies("auth", &["db"])).await.unwrap();
    fleet.control.fail_spawns("db").await;

    let status = orch.start_all().await.unwrap();
    assert_eq!(status.running, 0);
    assert_eq!(fleet.control.spawn_count("auth").await, 0);

    let db = status.services.iter().find(|s| s.name == "db").unwrap();
    assert!(db.last_error.as_deref().unwrap_or_default().contains("no such file"));
}

#[tokio::test]
async fn test_disabled_services_are_not_started() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    orch.register(service("auth")).await.unwrap();
    orch.set_status("auth", ServiceStatus::Disabled).await.unwrap();

    let status = orch.start_all().await.unwrap();
    assert_eq!(status.running, 0);
    assert!(matches!(
        orch.start("auth").await,
        Err(OrchestratorError::Config(_))
    ));
}

#[tokio::test]
async fn test_readiness_timeout_never_reaches_running() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    fleet
        .control
        .ready_on_spawn
        .store(false, std::sync::atomic::Ordering::SeqCst);
    fleet.health.set_healthy(false);

    let mut auth = service("auth");
    auth.restart_delay_ms = 10_000;
    orch.register(auth).await.unwrap();
    let mut events = orch.subscribe();

    let started = Instant::now();
    let result = orch.start("auth").await;
    assert!(matches!(
        result,
        Err(OrchestratorError::ReadinessTimeout { timeout_ms: 300, .. })
    ));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(orch.supervisor().state("auth").await, ServiceState::Failed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let events = drain(&mut events);
    assert!(events.iter().all(|e| e.to != ServiceState::Running));
    assert_eq!(
        events.last().map(|e| e.to),
        Some(ServiceState::Failed)
    );
    // The readiness failure counts against the budget
    assert_eq!(orch.restart_policy().budget_used("auth").await, 1);
}

#[tokio::test]
async fn test_first_successful_probe_marks_ready() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    fleet
        .control
        .ready_on_spawn
        .store(false, std::sync::atomic::Ordering::SeqCst);

    orch.register(service("auth")).await.unwrap();
    assert_eq!(orch.start("auth").await.unwrap(), ServiceState::Running);
    assert!(fleet.health.calls() >= 1);
}

#[tokio::test]
async fn test_readiness_signal_arriving_late() {
    let fleet = fleet();
    let orch = std::sync::Arc::clone(&fleet.orchestrator);
    fleet
        .control
        .ready_on_spawn
        .store(false, std::sync::atomic::Ordering::SeqCst);
    fleet.health.set_healthy(false);
    orch.register(service("auth")).await.unwrap();

    let starting = tokio::spawn(async move { orch.start("auth").await });
    let control = &fleet.control;
    assert!(eventually(WAIT, || async move { control.live_pid("auth").await.is_some() }).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    fleet.control.announce_ready("auth").await;

    assert_eq!(starting.await.unwrap().unwrap(), ServiceState::Running);
}

#[tokio::test]
async fn test_early_exit_fails_start() {
    let fleet = fleet();
    let orch = std::sync::Arc::clone(&fleet.orchestrator);
    fleet
        .control
        .ready_on_spawn
        .store(false, std::sync::atomic::Ordering::SeqCst);
    fleet.health.set_healthy(false);
    let mut auth = service("auth");
    auth.restart_delay_ms = 10_000;
    orch.register(auth).await.unwrap();

    let starting = tokio::spawn(async move { orch.start("auth").await });
    let control = &fleet.control;
    assert!(eventually(WAIT, || async move { control.live_pid("auth").await.is_some() }).await);
    fleet.control.crash("auth", 127).await;

    let result = starting.await.unwrap();
    assert!(matches!(result, Err(OrchestratorError::EarlyExit { .. })));
    assert_eq!(
        fleet.orchestrator.supervisor().state("auth").await,
        ServiceState::Failed
    );
}

#[tokio::test]
async fn test_stop_is_bounded_by_kill_timeout() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    fleet
        .control
        .exit_on_signal
        .store(false, std::sync::atomic::Ordering::SeqCst);
    orch.register(service("auth")).await.unwrap();
    orch.start("auth").await.unwrap();

    let started = Instant::now();
    assert_eq!(orch.stop("auth").await.unwrap(), ServiceState::Stopped);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(fleet.control.live_pid("auth").await, None);

    // Stopping a stopped service is a no-op
    assert_eq!(orch.stop("auth").await.unwrap(), ServiceState::Stopped);
}

#[tokio::test]
async fn test_status_report() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    orch.register(service("auth")).await.unwrap();
    orch.register(service("media")).await.unwrap();
    orch.start("auth").await.unwrap();

    let status = orch.status(None).await.unwrap();
    assert_eq!(status.total, 2);
    assert_eq!(status.running, 1);

    let auth = &status.services[0];
    assert_eq!(auth.name, "auth");
    assert_eq!(auth.state, ServiceState::Running);
    assert!(auth.pid.is_some());
    assert!(auth.uptime_ms.is_some());

    let media = &status.services[1];
    assert_eq!(media.state, ServiceState::Stopped);
    assert_eq!(media.pid, None);

    assert!(matches!(
        orch.status(Some("billing")).await,
        Err(OrchestratorError::NotFound(_))
    ));

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["services"][0]["state"], "running");
}

#[tokio::test]
async fn test_check_health() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    orch.register(service("auth")).await.unwrap();

    orch.check_health("auth").await.unwrap();
    fleet.health.set_healthy(false);
    assert!(matches!(
        orch.check_health("auth").await,
        Err(OrchestratorError::ProbeFailure { .. })
    ));
}

#[tokio::test]
async fn test_register_requires_dependencies() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    assert!(matches!(
        orch.register(with_dependencies("auth", &["db"])).await,
        Err(OrchestratorError::Dependency(
            DependencyError::UnknownDependency { .. }
        ))
    ));

    let cyclic = EcosystemFile::new(vec![
        with_dependencies("a", &["b"]),
        with_dependencies("b", &["a"]),
    ]);
    assert!(matches!(
        orch.load(cyclic).await,
        Err(OrchestratorError::Dependency(
            DependencyError::CyclicDependency(_)
        ))
    ));
    assert!(orch.registry().is_empty().await);
}

#[tokio::test]
async fn test_deregister_stops_service() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    orch.register(service("db")).await.unwrap();
    orch.register(with_dependencies("auth", &["db"])).await.unwrap();
    orch.start("db").await.unwrap();

    // Still required by auth
    assert!(orch.deregister("db").await.is_err());

    orch.deregister("auth").await.unwrap();
    let removed = orch.deregister("db").await.unwrap();
    assert_eq!(removed.name, "db");
    assert_eq!(fleet.control.live_pid("db").await, None);
    assert!(orch.registry().is_empty().await);
    assert!(orch.supervisor().services().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    orch.register(service("db")).await.unwrap();
    orch.register(with_dependencies("auth", &["db"])).await.unwrap();
    orch.start_all().await.unwrap();

    let mut events = orch.subscribe();
    orch.shutdown().await;

    let stopped: Vec<String> = drain(&mut events)
        .into_iter()
        .filter(|e| e.to == ServiceState::Stopped)
        .map(|e| e.service)
        .collect();
    assert_eq!(stopped, vec!["auth", "db"]);
    assert_eq!(fleet.control.live_pid("db").await, None);

    assert!(matches!(
        orch.start("db").await,
        Err(OrchestratorError::ShuttingDown)
    ));
    // A second shutdown returns immediately
    orch.shutdown().await;
}

#[tokio::test]
async fn test_crash_after_shutdown_is_not_restarted() {
    let fleet = fleet();
    let orch = &fleet.orchestrator;
    orch.register(service("auth")).await.unwrap();
    orch.start("auth").await.unwrap();
    orch.shutdown().await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fleet.control.spawn_count("auth").await, 1);
    assert_eq!(orch.supervisor().state("auth").await, ServiceState::Stopped);
}
