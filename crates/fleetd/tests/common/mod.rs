//! Test helpers for orchestrator integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use fleetd::runtime::OutputLog;
use fleetd::{
    Criticality, HealthCheck, Orchestrator, ProbeError, ProcessControl, ProcessError, ProcessExit,
    ServiceDescriptor, ServiceEvent, ServiceState, ServiceType, Settings, SpawnSpec,
    SpawnedProcess,
};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};

struct FakeChild {
    name: String,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    ready_tx: watch::Sender<bool>,
}

/// Scriptable [`ProcessControl`]: nothing is executed, every child is a
/// pair of watch channels the test drives by hand
pub struct FakeProcessControl {
    next_pid: AtomicU32,
    children: Mutex<HashMap<u32, FakeChild>>,
    spawns: Mutex<HashMap<String, u32>>,
    memory: Mutex<HashMap<u32, u64>>,
    failing: Mutex<HashSet<String>>,
    /// Children print the readiness line as soon as they start
    pub ready_on_spawn: AtomicBool,
    /// Children exit when asked to terminate gracefully
    pub exit_on_signal: AtomicBool,
}

impl FakeProcessControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(4000),
            children: Mutex::new(HashMap::new()),
            spawns: Mutex::new(HashMap::new()),
            memory: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            ready_on_spawn: AtomicBool::new(true),
            exit_on_signal: AtomicBool::new(true),
        })
    }

    /// Number of times `name` has been spawned
    pub async fn spawn_count(&self, name: &str) -> u32 {
        self.spawns.lock().await.get(name).copied().unwrap_or(0)
    }

    /// Make every spawn of `name` fail
    pub async fn fail_spawns(&self, name: &str) {
        self.failing.lock().await.insert(name.to_string());
    }

    /// Pid of the live child of `name`
    pub async fn live_pid(&self, name: &str) -> Option<u32> {
        self.children
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.name == name && c.exit_tx.borrow().is_none())
            .map(|(pid, _)| *pid)
            .max()
    }

    /// Make the live child of `name` exit with `code`
    pub async fn crash(&self, name: &str, code: i32) -> bool {
        let Some(pid) = self.live_pid(name).await else {
            return false;
        };
        self.exit(pid, Some(code)).await;
        true
    }

    /// Make the live child of `name` print the readiness line
    pub async fn announce_ready(&self, name: &str) {
        if let Some(pid) = self.live_pid(name).await {
            if let Some(child) = self.children.lock().await.get(&pid) {
                child.ready_tx.send_replace(true);
            }
        }
    }

    pub async fn set_memory(&self, pid: u32, bytes: u64) {
        self.memory.lock().await.insert(pid, bytes);
    }

    async fn exit(&self, pid: u32, code: Option<i32>) {
        if let Some(child) = self.children.lock().await.get(&pid) {
            if child.exit_tx.borrow().is_none() {
                child.exit_tx.send_replace(Some(ProcessExit { code }));
            }
        }
    }
}

#[async_trait]
impl ProcessControl for FakeProcessControl {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<SpawnedProcess, ProcessError> {
        *self.spawns.lock().await.entry(spec.name.clone()).or_default() += 1;
        if self.failing.lock().await.contains(&spec.name) {
            return Err(ProcessError::SpawnFailed {
                name: spec.name.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (exit_tx, exited) = watch::channel(None);
        let (ready_tx, ready) = watch::channel(self.ready_on_spawn.load(Ordering::SeqCst));
        self.children.lock().await.insert(
            pid,
            FakeChild {
                name: spec.name.clone(),
                exit_tx,
                ready_tx,
            },
        );

        Ok(SpawnedProcess {
            pid,
            exited,
            ready,
            output: OutputLog::new(spec.log_lines),
        })
    }

    async fn signal(&self, pid: u32) -> Result<(), ProcessError> {
        if self.exit_on_signal.load(Ordering::SeqCst) {
            self.exit(pid, Some(0)).await;
        }
        Ok(())
    }

    async fn force_kill(&self, pid: u32) -> Result<(), ProcessError> {
        self.exit(pid, None).await;
        Ok(())
    }

    async fn memory_usage(&self, pid: u32) -> Option<u64> {
        Some(
            self.memory
                .lock()
                .await
                .get(&pid)
                .copied()
                .unwrap_or(50_000_000),
        )
    }
}

/// Health check whose verdict the test flips
pub struct ScriptedHealthCheck {
    healthy: AtomicBool,
    calls: AtomicU32,
}

impl ScriptedHealthCheck {
    pub fn new(healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            healthy: AtomicBool::new(healthy),
            calls: AtomicU32::new(0),
        })
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for ScriptedHealthCheck {
    async fn check(&self, _endpoint: &str, _timeout: Duration) -> Result<(), ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProbeError::Status(503))
        }
    }
}

/// Settings with short intervals so scenarios run in well under a second
pub fn test_settings(archive_dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.archive_dir = archive_dir.to_path_buf();
    settings.health.interval_ms = 40;
    settings.health.timeout_ms = 100;
    settings.health.failure_threshold = 2;
    settings.restart.memory_check_interval_ms = 40;
    settings.process.readiness_poll_interval_ms = 20;
    settings
}

/// A critical core service with fast timings
pub fn service(name: &str) -> ServiceDescriptor {
    let mut descriptor = ServiceDescriptor::new(
        name,
        ServiceType::Core,
        Criticality::Critical,
        "node",
        "/srv/app",
        format!("http://127.0.0.1:7000/{}/health", name),
    );
    descriptor.min_uptime_ms = 10_000;
    descriptor.max_restarts = 3;
    descriptor.restart_delay_ms = 50;
    descriptor.health_grace_period_ms = 0;
    descriptor.readiness_timeout_ms = 300;
    descriptor.kill_timeout_ms = 200;
    descriptor
}

pub struct TestFleet {
    pub orchestrator: Arc<Orchestrator>,
    pub control: Arc<FakeProcessControl>,
    pub health: Arc<ScriptedHealthCheck>,
    pub archive_dir: tempfile::TempDir,
}

/// Orchestrator over fake processes with healthy probes
pub fn fleet() -> TestFleet {
    fleet_in(tempfile::tempdir().unwrap())
}

/// Like [`fleet`], on an existing archive directory
pub fn fleet_in(archive_dir: tempfile::TempDir) -> TestFleet {
    let control = FakeProcessControl::new();
    let health = ScriptedHealthCheck::new(true);
    let orchestrator = Orchestrator::with_components(
        test_settings(archive_dir.path()),
        control.clone(),
        health.clone(),
    );
    TestFleet {
        orchestrator,
        control,
        health,
        archive_dir,
    }
}

/// Wait until `name` reaches `state`
pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    name: &str,
    state: ServiceState,
    timeout: Duration,
) -> bool {
    let mut rx = orchestrator.supervisor().watch_state(name).await;
    tokio::time::timeout(timeout, async { rx.wait_for(|s| *s == state).await.is_ok() })
        .await
        .unwrap_or(false)
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Every event received so far
pub fn drain(rx: &mut broadcast::Receiver<ServiceEvent>) -> Vec<ServiceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
