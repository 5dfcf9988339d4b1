//! Orchestrator
//!
//! Wires the registry, supervisor, health prober, restart policy engine and
//! archiver together, runs the background tasks that connect them, and
//! exposes the operator commands: `start`, `stop`, `restart`, `status` and
//! `restore`.

use crate::archive::{ArchiveHandle, Archiver};
use crate::config::{
    Criticality, EcosystemFile, ServiceDescriptor, ServiceStatus, ServiceType, Settings,
};
use crate::error::{OrchestratorError, Result};
use crate::registry::{Registry, ServiceFilter};
use crate::runtime::{
    DependencyError, DependencyGraph, DirectiveAction, HealthCheck, HealthEvent, HealthProber,
    HttpHealthCheck, OutputLine, ProcessControl, RestartDirective, RestartPolicyEngine,
    RestartReason, ServiceEvent, ServiceState, Supervisor, TokioProcessControl,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Status of one service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatusReport {
    pub name: String,
    pub service_type: ServiceType,
    pub criticality: Criticality,
    pub status: ServiceStatus,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub uptime_ms: Option<u64>,
    pub restarts: u32,
    /// Fast failures counted against the restart budget
    pub restart_budget_used: u32,
    pub memory_bytes: Option<u64>,
    pub probe_failures: u32,
    pub last_error: Option<String>,
    pub recent_output: Vec<OutputLine>,
}

/// Status of the fleet
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub services: Vec<ServiceStatusReport>,
    pub total: usize,
    pub running: usize,
    pub unhealthy: usize,
    pub permanently_failed: usize,
    /// Orchestrator uptime
    pub uptime_ms: u64,
}

/// Outcome of a restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub snapshot_id: String,
    /// Services in the restored set
    pub services: usize,
    /// Services stopped and removed because the snapshot does not have them
    pub removed: Vec<String>,
    /// Running services restarted to pick up a changed descriptor
    pub restarted: Vec<String>,
}

/// Service orchestrator
pub struct Orchestrator {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    prober: Arc<HealthProber>,
    engine: Arc<RestartPolicyEngine>,
    archiver: Arc<Archiver>,
    archive: ArchiveHandle,
    root: CancellationToken,
    started_at: Instant,
    shutting_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Create an orchestrator that runs real processes and HTTP probes.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: Settings) -> Arc<Self> {
        Self::with_components(
            settings,
            Arc::new(TokioProcessControl::new()),
            Arc::new(HttpHealthCheck::new()),
        )
    }

    /// Create an orchestrator on top of the given process and health capabilities
    pub fn with_components(
        settings: Settings,
        control: Arc<dyn ProcessControl>,
        checker: Arc<dyn HealthCheck>,
    ) -> Arc<Self> {
        let root = CancellationToken::new();

        let archiver = Arc::new(Archiver::new(settings.archive_dir.clone()));
        let (archive, archive_task) = archiver.spawn_writer();
        let registry = Arc::new(Registry::new(Some(archive.clone())));

        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let prober = Arc::new(HealthProber::new(
            checker,
            settings.health.clone(),
            root.child_token(),
            health_tx,
        ));

        let (directive_tx, directive_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(RestartPolicyEngine::new(
            settings.restart.window(),
            root.child_token(),
            directive_tx,
        ));

        let (policy_tx, policy_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor::new(
            Arc::clone(&registry),
            control,
            Arc::clone(&prober),
            settings.process.clone(),
            policy_tx,
            Some(archive.clone()),
        );

        log::info!(
            "Orchestrator ready (archive: {})",
            settings.archive_dir.display()
        );

        let tasks = vec![
            archive_task,
            spawn_health_router(root.clone(), Arc::clone(&supervisor), health_rx),
            spawn_policy_router(
                root.clone(),
                Arc::clone(&registry),
                Arc::clone(&engine),
                policy_rx,
            ),
            spawn_directive_executor(
                root.clone(),
                Arc::clone(&supervisor),
                Arc::clone(&engine),
                directive_rx,
                settings.restart.max_concurrent_restarts,
            ),
            spawn_memory_monitor(
                root.clone(),
                Arc::clone(&registry),
                Arc::clone(&supervisor),
                Arc::clone(&engine),
                settings.restart.memory_check_interval(),
            ),
        ];

        Arc::new(Self {
            registry,
            supervisor,
            prober,
            engine,
            archiver,
            archive,
            root,
            started_at: Instant::now(),
            shutting_down: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn restart_policy(&self) -> &Arc<RestartPolicyEngine> {
        &self.engine
    }

    pub fn archiver(&self) -> &Arc<Archiver> {
        &self.archiver
    }

    /// Subscribe to lifecycle transitions of every service
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.supervisor.subscribe()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(OrchestratorError::ShuttingDown);
        }
        Ok(())
    }

    /// Register every service of an ecosystem file, dependencies first.
    ///
    /// Services that were running under a previous orchestrator get their
    /// saved restart count, last error and permanent failure back.
    pub async fn load(&self, ecosystem: EcosystemFile) -> Result<()> {
        self.ensure_running()?;
        ecosystem.validate()?;

        let mut known = self.registry.list(&ServiceFilter::all()).await;
        known.extend(ecosystem.services.iter().cloned());
        let graph = DependencyGraph::build(&known)?;

        let mut pending: HashMap<String, ServiceDescriptor> = ecosystem
            .services
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let loaded: HashSet<String> = pending.keys().cloned().collect();
        for name in graph.launch_order() {
            if let Some(descriptor) = pending.remove(name) {
                self.register(descriptor).await?;
            }
        }
        log::info!(
            "Loaded {} services ({} registered)",
            loaded.len(),
            self.registry.len().await
        );

        let mut seeded = 0;
        for saved in self.archiver.load_state().await {
            if loaded.contains(&saved.name) && self.supervisor.seed(&saved).await {
                seeded += 1;
            }
        }
        if seeded > 0 {
            log::info!("Restored saved runtime state of {} services", seeded);
        }
        Ok(())
    }

    /// Register one service; its dependencies must already be registered
    pub async fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        self.ensure_running()?;
        for dependency in &descriptor.dependencies {
            if !self.registry.contains(dependency).await {
                return Err(DependencyError::UnknownDependency {
                    service: descriptor.name.clone(),
                    dependency: dependency.clone(),
                }
                .into());
            }
        }
        self.registry.register(descriptor).await
    }

    /// Stop and remove a service
    pub async fn deregister(&self, name: &str) -> Result<ServiceDescriptor> {
        self.ensure_running()?;
        let dependents: Vec<String> = self
            .registry
            .list(&ServiceFilter::all())
            .await
            .into_iter()
            .filter(|d| d.dependencies.iter().any(|dep| dep == name))
            .map(|d| d.name)
            .collect();
        if !dependents.is_empty() {
            return Err(OrchestratorError::Config(crate::config::ConfigError::Invalid {
                service: name.to_string(),
                reason: format!("still required by {}", dependents.join(", ")),
            }));
        }

        self.engine.cancel_pending(name).await;
        self.supervisor.stop(name).await?;
        self.engine.forget(name).await;
        let descriptor = self.registry.deregister(name).await?;
        self.supervisor.remove(name).await;
        Ok(descriptor)
    }

    /// Change the registry status of a service
    pub async fn set_status(&self, name: &str, status: ServiceStatus) -> Result<()> {
        self.ensure_running()?;
        self.registry.update_status(name, status).await
    }

    /// Registered services matching `filter`
    pub async fn services(&self, filter: &ServiceFilter) -> Vec<ServiceDescriptor> {
        self.registry.list(filter).await
    }

    /// Start a service and wait until it is running or has failed.
    ///
    /// Bringing back a permanently failed service gives it a fresh restart
    /// budget.
    pub async fn start(&self, name: &str) -> Result<ServiceState> {
        self.ensure_running()?;
        self.engine.cancel_pending(name).await;
        if self.supervisor.state(name).await == ServiceState::PermanentlyFailed {
            log::info!("[{}] Manual start, restart budget reset", name);
            self.engine.reset(name).await;
        }
        self.supervisor.start(name).await
    }

    /// Stop a service
    pub async fn stop(&self, name: &str) -> Result<ServiceState> {
        self.ensure_running()?;
        self.engine.cancel_pending(name).await;
        self.supervisor.stop(name).await
    }

    /// Restart a service.
    ///
    /// The restart budget carries over unless `reset_budget` is set.
    pub async fn restart(&self, name: &str, reset_budget: bool) -> Result<ServiceState> {
        self.ensure_running()?;
        self.engine.cancel_pending(name).await;
        if reset_budget {
            self.engine.reset(name).await;
        }
        self.supervisor.restart(name).await
    }

    /// Status of one service, or of every service when `name` is `None`
    pub async fn status(&self, name: Option<&str>) -> Result<FleetStatus> {
        let descriptors = match name {
            Some(name) => vec![self.registry.lookup(name).await?],
            None => self.registry.list(&ServiceFilter::all()).await,
        };

        let mut services = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            services.push(self.report(descriptor).await);
        }

        let count = |state: ServiceState| services.iter().filter(|s| s.state == state).count();
        Ok(FleetStatus {
            total: services.len(),
            running: count(ServiceState::Running),
            unhealthy: count(ServiceState::Unhealthy),
            permanently_failed: count(ServiceState::PermanentlyFailed),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            services,
        })
    }

    async fn report(&self, descriptor: ServiceDescriptor) -> ServiceStatusReport {
        let runtime = self.supervisor.runtime_status(&descriptor.name).await;
        ServiceStatusReport {
            restart_budget_used: self.engine.budget_used(&descriptor.name).await,
            probe_failures: self.prober.consecutive_failures(&descriptor.name).await,
            name: descriptor.name,
            service_type: descriptor.service_type,
            criticality: descriptor.criticality,
            status: descriptor.status,
            state: runtime.state,
            pid: runtime.pid,
            uptime_ms: runtime.uptime.map(|u| u.as_millis() as u64),
            restarts: runtime.restarts,
            memory_bytes: runtime.memory_bytes,
            last_error: runtime.last_error,
            recent_output: runtime.recent_output,
        }
    }

    /// Probe a service's health endpoint once
    pub async fn check_health(&self, name: &str) -> Result<()> {
        let descriptor = self.registry.lookup(name).await?;
        self.prober
            .probe_once(&descriptor.health_endpoint)
            .await
            .map_err(|e| OrchestratorError::from_probe(name, e))
    }

    /// Wait until every queued snapshot has been written
    pub async fn flush_archive(&self) {
        self.archive.flush().await;
    }

    /// Ids of archived snapshots, oldest first
    pub async fn snapshots(&self) -> Result<Vec<String>> {
        self.archiver.list_snapshots().await
    }

    /// Replace the registry with an archived snapshot.
    ///
    /// Nothing changes unless the snapshot passes validation. Services the
    /// snapshot drops are stopped, and active services whose descriptor
    /// changed are restarted.
    pub async fn restore(&self, snapshot_id: &str) -> Result<RestoreReport> {
        self.ensure_running()?;
        let snapshot = self.archiver.restore(snapshot_id).await?;
        let invalid = |reason: String| OrchestratorError::RestoreValidation {
            snapshot: snapshot_id.to_string(),
            reason,
        };

        let mut names = HashSet::new();
        for descriptor in &snapshot.descriptors {
            if !names.insert(descriptor.name.as_str()) {
                return Err(invalid(format!("duplicate service '{}'", descriptor.name)));
            }
        }
        let graph = DependencyGraph::build(&snapshot.descriptors).map_err(|e| invalid(e.to_string()))?;

        let current: HashMap<String, ServiceDescriptor> = self
            .registry
            .list(&ServiceFilter::all())
            .await
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let mut removed: Vec<String> = current
            .keys()
            .filter(|name| !names.contains(name.as_str()))
            .cloned()
            .collect();
        removed.sort();
        let changed: HashSet<&str> = snapshot
            .descriptors
            .iter()
            .filter(|d| current.get(&d.name).map_or(false, |c| c != *d))
            .map(|d| d.name.as_str())
            .collect();

        log::info!(
            "Restoring snapshot {} ({} services, {} removed, {} changed)",
            snapshot.id,
            snapshot.descriptors.len(),
            removed.len(),
            changed.len()
        );

        for name in &removed {
            self.engine.cancel_pending(name).await;
            if let Err(e) = self.supervisor.stop(name).await {
                log::warn!("[{}] {}", name, e);
            }
            self.engine.forget(name).await;
        }

        let services = snapshot.descriptors.len();
        self.registry.replace_all(snapshot.descriptors.clone()).await?;
        for name in &removed {
            self.supervisor.remove(name).await;
        }

        let mut restarted = Vec::new();
        for name in graph.launch_order() {
            if !changed.contains(name) || !self.supervisor.state(name).await.is_active() {
                continue;
            }
            self.engine.cancel_pending(name).await;
            match self.supervisor.restart(name).await {
                Ok(_) => restarted.push(name.to_string()),
                Err(e) => log::warn!("[{}] Restart after restore failed: {}", name, e),
            }
        }

        Ok(RestoreReport {
            snapshot_id: snapshot.id,
            services,
            removed,
            restarted,
        })
    }

    /// Start every autostart service and what it depends on.
    ///
    /// Permanently failed services are left alone.
    pub async fn start_all(&self) -> Result<FleetStatus> {
        let roots: Vec<String> = self
            .registry
            .list(&ServiceFilter::all())
            .await
            .into_iter()
            .filter(|d| d.should_autostart())
            .map(|d| d.name)
            .collect();
        self.start_with_dependencies(&roots).await
    }

    /// Start the given services and what they depend on, level by level in
    /// dependency order. Failures are logged and skipped, and services whose
    /// dependencies did not come up are not started.
    pub async fn start_with_dependencies(&self, roots: &[String]) -> Result<FleetStatus> {
        self.ensure_running()?;
        let descriptors = self.registry.list(&ServiceFilter::all()).await;
        let graph = DependencyGraph::build(&descriptors)?;
        let by_name: HashMap<&str, &ServiceDescriptor> =
            descriptors.iter().map(|d| (d.name.as_str(), d)).collect();
        if let Some(unknown) = roots.iter().find(|r| !by_name.contains_key(r.as_str())) {
            return Err(OrchestratorError::NotFound(unknown.clone()));
        }

        let wanted = graph.closure(roots.iter().map(String::as_str));
        log::info!("Starting {} of {} services", wanted.len(), descriptors.len());

        for level in graph.levels() {
            let mut batch = Vec::new();
            for name in level.iter().filter(|n| wanted.contains(*n)) {
                let Some(descriptor) = by_name.get(name.as_str()) else {
                    continue;
                };
                if !descriptor.status.is_startable() {
                    log::info!("[{}] Skipping, service is {:?}", name, descriptor.status);
                    continue;
                }
                if self.supervisor.state(name).await == ServiceState::PermanentlyFailed {
                    log::warn!("[{}] Skipping, permanently failed until started manually", name);
                    continue;
                }
                let mut blocked = None;
                for dependency in graph.dependencies_of(name) {
                    if self.supervisor.state(dependency).await != ServiceState::Running {
                        blocked = Some(dependency.clone());
                        break;
                    }
                }
                if let Some(dependency) = blocked {
                    log::warn!("[{}] Skipping, dependency '{}' is not running", name, dependency);
                    continue;
                }
                batch.push(name.clone());
            }

            let results = futures::future::join_all(batch.iter().map(|name| async move {
                (name, self.supervisor.start(name).await)
            }))
            .await;
            for (name, result) in results {
                if let Err(e) = result {
                    log::error!("[{}] Failed to start: {}", name, e);
                }
            }
        }

        self.status(None).await
    }

    /// Stop every service, dependents first, and wait for pending snapshots.
    ///
    /// Probes and restart timers are cancelled before anything is stopped.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("Shutting down...");
        // Saved state keeps what the fleet looked like before the stop
        self.supervisor.stop_recording();
        self.root.cancel();
        self.prober.shutdown().await;

        let descriptors = self.registry.list(&ServiceFilter::all()).await;
        let levels = match DependencyGraph::build(&descriptors) {
            Ok(graph) => graph.levels(),
            Err(e) => {
                log::warn!("{}, stopping all services at once", e);
                vec![descriptors.iter().map(|d| d.name.clone()).collect()]
            }
        };

        for level in levels.iter().rev() {
            let results = futures::future::join_all(
                level
                    .iter()
                    .map(|name| async move { (name, self.supervisor.stop(name).await) }),
            )
            .await;
            for (name, result) in results {
                if let Err(e) = result {
                    log::warn!("[{}] {}", name, e);
                }
            }
        }

        self.archive.flush().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        log::info!("Shutdown complete");
    }
}

/// Route prober events into supervisor transitions
fn spawn_health_router(
    token: CancellationToken,
    supervisor: Arc<Supervisor>,
    mut health_rx: mpsc::UnboundedReceiver<HealthEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = health_rx.recv() => match event {
                    Some(HealthEvent::Unhealthy { service, generation, error }) => {
                        supervisor
                            .mark_unhealthy(&service, generation, error.to_string())
                            .await;
                    }
                    Some(HealthEvent::Recovered { service, generation }) => {
                        supervisor.mark_recovered(&service, generation).await;
                    }
                    None => break,
                },
            }
        }
    })
}

/// Feed supervisor transitions to the restart policy engine
fn spawn_policy_router(
    token: CancellationToken,
    registry: Arc<Registry>,
    engine: Arc<RestartPolicyEngine>,
    mut policy_rx: mpsc::UnboundedReceiver<ServiceEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                event = policy_rx.recv() => {
                    let Some(event) = event else { break };
                    match registry.lookup(&event.service).await {
                        Ok(descriptor) => engine.on_event(&event, &descriptor).await,
                        Err(_) => log::debug!("[{}] No longer registered, ignoring {}", event.service, event.to),
                    }
                }
            }
        }
    })
}

/// Execute restart directives, a bounded number at a time
fn spawn_directive_executor(
    token: CancellationToken,
    supervisor: Arc<Supervisor>,
    engine: Arc<RestartPolicyEngine>,
    mut directive_rx: mpsc::UnboundedReceiver<RestartDirective>,
    max_concurrent: usize,
) -> JoinHandle<()> {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    tokio::spawn(async move {
        loop {
            let directive = tokio::select! {
                _ = token.cancelled() => break,
                directive = directive_rx.recv() => match directive {
                    Some(directive) => directive,
                    None => break,
                },
            };
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            if token.is_cancelled() {
                break;
            }

            let supervisor = Arc::clone(&supervisor);
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                let _permit = permit;
                let RestartDirective { service, action } = directive;
                let result = supervisor.execute(&service, action).await;
                if action == DirectiveAction::Restart(RestartReason::Proactive)
                    && !matches!(result, Ok(ServiceState::Running))
                {
                    engine.clear_proactive(&service).await;
                }
                match result {
                    Ok(_) => {}
                    // The failed attempt feeds the policy again, which decides what follows
                    Err(e) if e.is_transient() => {
                        log::warn!("[{}] Restart attempt failed: {}", service, e)
                    }
                    Err(e) => log::error!("[{}] Restart failed: {}", service, e),
                }
            });
        }
    })
}

/// Periodically compare memory usage with each service's limit
fn spawn_memory_monitor(
    token: CancellationToken,
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    engine: Arc<RestartPolicyEngine>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    for (name, bytes) in supervisor.sample_memory().await {
                        if let Ok(descriptor) = registry.lookup(&name).await {
                            engine.observe_memory(&descriptor, bytes).await;
                        }
                    }
                }
            }
        }
    })
}
