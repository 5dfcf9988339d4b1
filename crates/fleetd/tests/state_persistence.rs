//! State Persistence
//!
//! Runtime state saved by one orchestrator and picked up by the next one
//! started on the same archive directory.

mod common;

use common::*;
use fleetd::archive::STATE_FILE;
use fleetd::{EcosystemFile, ServiceState};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(3);

fn ecosystem() -> EcosystemFile {
    let mut auth = service("auth");
    auth.max_restarts = 1;
    EcosystemFile::new(vec![auth, service("media")])
}

#[tokio::test]
async fn test_runtime_state_survives_orchestrator_restart() {
    let first = fleet();
    let orch = &first.orchestrator;
    orch.load(ecosystem()).await.unwrap();
    assert_eq!(orch.start_all().await.unwrap().running, 2);

    // auth exhausts its budget, media recovers from one crash
    let control = &first.control;
    assert!(control.crash("auth", 1).await);
    assert!(eventually(WAIT, || async move { control.spawn_count("auth").await == 2 }).await);
    assert!(wait_for_state(orch, "auth", ServiceState::Running, WAIT).await);
    assert!(control.crash("auth", 1).await);
    assert!(wait_for_state(orch, "auth", ServiceState::PermanentlyFailed, WAIT).await);

    assert!(control.crash("media", 2).await);
    assert!(eventually(WAIT, || async move { control.spawn_count("media").await == 2 }).await);
    assert!(wait_for_state(orch, "media", ServiceState::Running, WAIT).await);

    orch.shutdown().await;
    let TestFleet { archive_dir, .. } = first;
    assert!(archive_dir.path().join(STATE_FILE).exists());

    let second = fleet_in(archive_dir);
    let orch = &second.orchestrator;
    orch.load(ecosystem()).await.unwrap();

    let status = orch.status(None).await.unwrap();
    let auth = &status.services[0];
    assert_eq!(auth.state, ServiceState::PermanentlyFailed);
    assert_eq!(auth.restarts, 1);
    assert!(auth
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("restart budget"));

    // Running before the shutdown, but its process is gone
    let media = &status.services[1];
    assert_eq!(media.state, ServiceState::Stopped);
    assert_eq!(media.restarts, 1);
    assert_eq!(media.pid, None);

    // A permanently failed service waits for the operator
    let status = orch.start_all().await.unwrap();
    assert_eq!(status.running, 1);
    assert_eq!(status.permanently_failed, 1);
    assert_eq!(second.control.spawn_count("auth").await, 0);

    assert_eq!(orch.start("auth").await.unwrap(), ServiceState::Running);
    orch.shutdown().await;
}

#[tokio::test]
async fn test_deregistered_service_is_not_restored() {
    let first = fleet();
    let orch = &first.orchestrator;
    orch.load(ecosystem()).await.unwrap();
    orch.start("media").await.unwrap();
    orch.restart("media", false).await.unwrap();
    orch.deregister("media").await.unwrap();
    orch.shutdown().await;

    let TestFleet { archive_dir, .. } = first;
    let second = fleet_in(archive_dir);
    second.orchestrator.load(ecosystem()).await.unwrap();

    let status = second.orchestrator.status(Some("media")).await.unwrap();
    assert_eq!(status.services[0].state, ServiceState::Stopped);
    assert_eq!(status.services[0].restarts, 0);
}
