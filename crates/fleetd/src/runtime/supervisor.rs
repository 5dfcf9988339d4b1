//! Process supervisor
//!
//! Owns the lifecycle state of every service. Each service has one slot
//! behind its own mutex, and every operation on a service holds that mutex
//! from its first transition to its last, so transitions of one service
//! never interleave. The supervisor never decides to restart on its own: it
//! executes operator commands and directives from the restart policy.

use crate::archive::{ArchiveHandle, SavedServiceState};
use crate::config::{ConfigError, ProcessSettings, ServiceDescriptor};
use crate::error::{OrchestratorError, Result};
use crate::registry::Registry;
use crate::runtime::health::{HealthProber, ProbeTarget};
use crate::runtime::process::{
    OutputLine, OutputLog, ProcessControl, ProcessError, ProcessExit, SpawnSpec,
};
use crate::runtime::restart::{DirectiveAction, RestartReason};
use crate::runtime::state::{ServiceEvent, ServiceState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};

/// Capacity of the transition broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A spawned process, owned by its service slot until it exits
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub spawned_at: DateTime<Utc>,
    pub memory_bytes: Option<u64>,
    exited: watch::Receiver<Option<ProcessExit>>,
    output: OutputLog,
}

/// Runtime view of one service
#[derive(Debug, Clone, Default)]
pub struct RuntimeStatus {
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub spawned_at: Option<DateTime<Utc>>,
    /// Time since the service last became ready
    pub uptime: Option<Duration>,
    /// Restarts executed by the supervisor, of any cause
    pub restarts: u32,
    pub memory_bytes: Option<u64>,
    pub last_error: Option<String>,
    pub recent_output: Vec<OutputLine>,
}

struct ServiceSlot {
    name: String,
    state: ServiceState,
    state_tx: watch::Sender<ServiceState>,
    /// Bumped on every spawn; stale exit and health reports are ignored
    generation: u64,
    handle: Option<ProcessHandle>,
    running_since: Option<Instant>,
    changed_at: DateTime<Utc>,
    restarts: u32,
    last_error: Option<String>,
    last_output: Option<OutputLog>,
}

impl ServiceSlot {
    fn saved_state(&self) -> SavedServiceState {
        SavedServiceState {
            name: self.name.clone(),
            state: self.state,
            restarts: self.restarts,
            last_error: self.last_error.clone(),
            changed_at: self.changed_at.to_rfc3339(),
        }
    }
}

struct SlotEntry {
    slot: Arc<Mutex<ServiceSlot>>,
    state: watch::Receiver<ServiceState>,
}

enum Readiness {
    Ready(&'static str),
    Exited(ProcessExit),
    TimedOut,
}

/// Process supervisor
pub struct Supervisor {
    registry: Arc<Registry>,
    control: Arc<dyn ProcessControl>,
    prober: Arc<HealthProber>,
    settings: ProcessSettings,
    slots: RwLock<HashMap<String, SlotEntry>>,
    /// Observers of transitions
    event_tx: broadcast::Sender<ServiceEvent>,
    /// Lossless feed for the restart policy
    policy_tx: mpsc::UnboundedSender<ServiceEvent>,
    /// Receives the runtime state of a service after each transition
    state_archive: Option<ArchiveHandle>,
    recording: AtomicBool,
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        control: Arc<dyn ProcessControl>,
        prober: Arc<HealthProber>,
        settings: ProcessSettings,
        policy_tx: mpsc::UnboundedSender<ServiceEvent>,
        state_archive: Option<ArchiveHandle>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            registry,
            control,
            prober,
            settings,
            slots: RwLock::new(HashMap::new()),
            event_tx,
            policy_tx,
            state_archive,
            recording: AtomicBool::new(true),
        })
    }

    /// Subscribe to lifecycle transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.event_tx.subscribe()
    }

    async fn slot(&self, name: &str) -> Arc<Mutex<ServiceSlot>> {
        if let Some(entry) = self.slots.read().await.get(name) {
            return Arc::clone(&entry.slot);
        }
        let mut slots = self.slots.write().await;
        let entry = slots.entry(name.to_string()).or_insert_with(|| {
            let (state_tx, state) = watch::channel(ServiceState::Stopped);
            SlotEntry {
                slot: Arc::new(Mutex::new(ServiceSlot {
                    name: name.to_string(),
                    state: ServiceState::Stopped,
                    state_tx,
                    generation: 0,
                    handle: None,
                    running_since: None,
                    changed_at: Utc::now(),
                    restarts: 0,
                    last_error: None,
                    last_output: None,
                })),
                state,
            }
        });
        Arc::clone(&entry.slot)
    }

    async fn existing_slot(&self, name: &str) -> Option<Arc<Mutex<ServiceSlot>>> {
        self.slots
            .read()
            .await
            .get(name)
            .map(|entry| Arc::clone(&entry.slot))
    }

    /// Current state; does not wait for an operation in progress
    pub async fn state(&self, name: &str) -> ServiceState {
        self.slots
            .read()
            .await
            .get(name)
            .map(|entry| *entry.state.borrow())
            .unwrap_or_default()
    }

    /// Watch the state of a service
    pub async fn watch_state(&self, name: &str) -> watch::Receiver<ServiceState> {
        self.slot(name).await;
        let slots = self.slots.read().await;
        match slots.get(name) {
            Some(entry) => entry.state.clone(),
            None => watch::channel(ServiceState::Stopped).1,
        }
    }

    /// Names of services the supervisor has seen
    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Forget a stopped service
    pub async fn remove(&self, name: &str) {
        let mut slots = self.slots.write().await;
        let stopped = slots
            .get(name)
            .map_or(false, |entry| *entry.state.borrow() == ServiceState::Stopped);
        if stopped {
            slots.remove(name);
            if let Some(archive) = &self.state_archive {
                archive.forget_state(name);
            }
        }
    }

    /// Seed a service that has not run yet with its saved runtime state.
    ///
    /// Restart count and last error carry over. A permanently failed service
    /// stays permanently failed; any other state becomes `Stopped`, since
    /// its process did not survive the orchestrator.
    pub async fn seed(&self, saved: &SavedServiceState) -> bool {
        let slot = self.slot(&saved.name).await;
        let mut slot = slot.lock().await;
        if slot.generation != 0 || slot.state != ServiceState::Stopped {
            return false;
        }

        slot.restarts = saved.restarts;
        slot.last_error = saved.last_error.clone();
        if let Ok(changed_at) = DateTime::parse_from_rfc3339(&saved.changed_at) {
            slot.changed_at = changed_at.with_timezone(&Utc);
        }
        if saved.state == ServiceState::PermanentlyFailed {
            slot.state = ServiceState::PermanentlyFailed;
            slot.state_tx.send_replace(ServiceState::PermanentlyFailed);
        }
        log::debug!(
            "[{}] Seeded as {} with {} restarts",
            slot.name,
            slot.state,
            slot.restarts
        );
        self.record_state(&slot);
        true
    }

    /// Stop saving runtime state; later transitions are not persisted
    pub fn stop_recording(&self) {
        self.recording.store(false, Ordering::SeqCst);
    }

    fn record_state(&self, slot: &ServiceSlot) {
        if let Some(archive) = &self.state_archive {
            if self.recording.load(Ordering::SeqCst) {
                archive.record_state(slot.saved_state());
            }
        }
    }

    /// Start a service and wait until it is ready or has failed
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<ServiceState> {
        let descriptor = self.startable_descriptor(name).await?;
        let slot = self.slot(name).await;
        let mut slot = slot.lock().await;
        self.start_locked(&mut slot, &descriptor).await
    }

    /// Stop a service; always ends in `Stopped`
    pub async fn stop(&self, name: &str) -> Result<ServiceState> {
        let descriptor = self.registry.lookup(name).await?;
        let Some(slot) = self.existing_slot(name).await else {
            return Ok(ServiceState::Stopped);
        };
        let mut slot = slot.lock().await;
        self.stop_locked(&mut slot, descriptor.kill_timeout()).await
    }

    /// Stop then start, holding the service for the whole operation
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<ServiceState> {
        let descriptor = self.startable_descriptor(name).await?;
        let slot = self.slot(name).await;
        let mut slot = slot.lock().await;
        if slot.state != ServiceState::Stopped {
            self.stop_locked(&mut slot, descriptor.kill_timeout()).await?;
            slot.restarts += 1;
        }
        self.start_locked(&mut slot, &descriptor).await
    }

    /// Execute a restart-policy directive.
    ///
    /// Directives that no longer apply, because an operator stopped or
    /// restarted the service in the meantime, are ignored.
    pub async fn execute(
        self: &Arc<Self>,
        name: &str,
        action: DirectiveAction,
    ) -> Result<ServiceState> {
        let descriptor = self.registry.lookup(name).await?;
        let Some(slot) = self.existing_slot(name).await else {
            return Ok(ServiceState::Stopped);
        };
        let mut slot = slot.lock().await;

        match action {
            DirectiveAction::Restart(RestartReason::Proactive) => {
                if slot.state != ServiceState::Running {
                    log::debug!("[{}] Ignoring proactive restart in {}", name, slot.state);
                    return Ok(slot.state);
                }
                log::info!("[{}] Proactive restart (memory limit)", name);
                self.stop_locked(&mut slot, descriptor.kill_timeout()).await?;
                slot.restarts += 1;
                self.start_locked(&mut slot, &descriptor).await
            }
            DirectiveAction::Restart(reason) => {
                if !Self::awaiting_directive(slot.state) {
                    log::debug!("[{}] Ignoring {} restart in {}", name, reason, slot.state);
                    return Ok(slot.state);
                }
                if !descriptor.status.is_startable() {
                    log::info!(
                        "[{}] Not restarting, service is {:?}",
                        name,
                        descriptor.status
                    );
                    return Ok(slot.state);
                }

                self.prober.cancel(name).await;
                self.transition(&mut slot, ServiceState::Restarting, Some(reason.to_string()))?;
                self.release_process(&mut slot, descriptor.kill_timeout()).await;
                slot.restarts += 1;
                self.start_locked(&mut slot, &descriptor).await
            }
            DirectiveAction::GiveUp { attempts } => {
                if !Self::awaiting_directive(slot.state) {
                    return Ok(slot.state);
                }

                self.prober.cancel(name).await;
                self.release_process(&mut slot, descriptor.kill_timeout()).await;
                let detail = format!("restart budget exhausted after {} failures", attempts);
                slot.last_error = Some(detail.clone());
                self.transition(&mut slot, ServiceState::PermanentlyFailed, Some(detail))?;
                Err(OrchestratorError::RestartBudgetExceeded {
                    service: name.to_string(),
                    attempts,
                })
            }
        }
    }

    fn awaiting_directive(state: ServiceState) -> bool {
        matches!(
            state,
            ServiceState::Crashed | ServiceState::Failed | ServiceState::Unhealthy
        )
    }

    /// Health prober reported sustained failure
    pub async fn mark_unhealthy(&self, name: &str, generation: u64, error: String) {
        let Some(slot) = self.existing_slot(name).await else {
            return;
        };
        let mut slot = slot.lock().await;
        if slot.generation != generation || slot.state != ServiceState::Running {
            return;
        }
        slot.last_error = Some(error.clone());
        if let Err(e) = self.transition(&mut slot, ServiceState::Unhealthy, Some(error)) {
            log::error!("[{}] {}", name, e);
        }
    }

    /// Health prober saw a successful probe after failures
    pub async fn mark_recovered(&self, name: &str, generation: u64) {
        let Some(slot) = self.existing_slot(name).await else {
            return;
        };
        let mut slot = slot.lock().await;
        if slot.generation != generation || slot.state != ServiceState::Unhealthy {
            return;
        }
        if let Err(e) = self.transition(&mut slot, ServiceState::Running, Some("recovered".to_string())) {
            log::error!("[{}] {}", name, e);
        }
    }

    /// Sample the memory of every running process.
    ///
    /// Services busy with another operation are skipped this round.
    pub async fn sample_memory(&self) -> Vec<(String, u64)> {
        let slots: Vec<Arc<Mutex<ServiceSlot>>> = self
            .slots
            .read()
            .await
            .values()
            .map(|entry| Arc::clone(&entry.slot))
            .collect();

        let mut samples = Vec::new();
        for slot in slots {
            let Ok(mut slot) = slot.try_lock() else {
                continue;
            };
            if !matches!(slot.state, ServiceState::Running | ServiceState::Unhealthy) {
                continue;
            }
            let name = slot.name.clone();
            if let Some(handle) = slot.handle.as_mut() {
                if let Some(bytes) = self.control.memory_usage(handle.pid).await {
                    handle.memory_bytes = Some(bytes);
                    samples.push((name, bytes));
                }
            }
        }
        samples
    }

    /// Runtime status of one service
    pub async fn runtime_status(&self, name: &str) -> RuntimeStatus {
        let (slot, state) = {
            let slots = self.slots.read().await;
            match slots.get(name) {
                Some(entry) => (Arc::clone(&entry.slot), *entry.state.borrow()),
                None => return RuntimeStatus::default(),
            }
        };

        // An operation in progress holds the slot; report its state only
        let Ok(slot) = slot.try_lock() else {
            return RuntimeStatus {
                state,
                ..Default::default()
            };
        };

        let output = slot
            .handle
            .as_ref()
            .map(|h| &h.output)
            .or(slot.last_output.as_ref());
        let recent_output = match output {
            Some(output) => output.recent().await,
            None => Vec::new(),
        };

        RuntimeStatus {
            state: slot.state,
            pid: slot.handle.as_ref().map(|h| h.pid),
            spawned_at: slot.handle.as_ref().map(|h| h.spawned_at),
            uptime: if slot.state.is_active() {
                slot.running_since.map(|t| t.elapsed())
            } else {
                None
            },
            restarts: slot.restarts,
            memory_bytes: slot.handle.as_ref().and_then(|h| h.memory_bytes),
            last_error: slot.last_error.clone(),
            recent_output,
        }
    }

    async fn startable_descriptor(&self, name: &str) -> Result<ServiceDescriptor> {
        let descriptor = self.registry.lookup(name).await?;
        if !descriptor.status.is_startable() {
            return Err(ConfigError::Invalid {
                service: name.to_string(),
                reason: format!("service is {:?} and cannot be started", descriptor.status),
            }
            .into());
        }
        Ok(descriptor)
    }

    fn transition(
        &self,
        slot: &mut ServiceSlot,
        to: ServiceState,
        detail: Option<String>,
    ) -> Result<()> {
        let from = slot.state;
        if !from.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition {
                service: slot.name.clone(),
                from,
                to,
            });
        }

        let uptime = slot.running_since.map(|t| t.elapsed());
        slot.state = to;
        slot.changed_at = Utc::now();
        match to {
            ServiceState::Running if from == ServiceState::Starting => {
                slot.running_since = Some(Instant::now());
            }
            ServiceState::Starting | ServiceState::Stopped => slot.running_since = None,
            _ => {}
        }
        slot.state_tx.send_replace(to);
        self.record_state(slot);

        match (&detail, to) {
            (_, ServiceState::PermanentlyFailed) => log::error!(
                "[{}] {} -> {}: {}",
                slot.name,
                from,
                to,
                detail.as_deref().unwrap_or("manual intervention required")
            ),
            (Some(detail), _) => log::info!("[{}] {} -> {} ({})", slot.name, from, to, detail),
            (None, _) => log::info!("[{}] {} -> {}", slot.name, from, to),
        }

        let mut event = ServiceEvent::new(slot.name.clone(), from, to).with_uptime(uptime);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        let _ = self.policy_tx.send(event.clone());
        let _ = self.event_tx.send(event);
        Ok(())
    }

    async fn start_locked(
        self: &Arc<Self>,
        slot: &mut ServiceSlot,
        descriptor: &ServiceDescriptor,
    ) -> Result<ServiceState> {
        match slot.state {
            ServiceState::Starting | ServiceState::Running | ServiceState::Unhealthy => {
                return Ok(slot.state);
            }
            ServiceState::Crashed => {
                // The process is already gone; settle before starting over
                self.transition(slot, ServiceState::Stopping, None)?;
                self.transition(slot, ServiceState::Stopped, None)?;
            }
            _ => {}
        }

        slot.generation += 1;
        let generation = slot.generation;
        self.transition(slot, ServiceState::Starting, None)?;

        let spec = SpawnSpec::from_descriptor(descriptor, self.settings.log_lines);
        let spawned = match self.control.spawn(&spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                let detail = e.to_string();
                log::error!("[{}] {}", slot.name, detail);
                slot.last_error = Some(detail.clone());
                self.transition(slot, ServiceState::Failed, Some(detail))?;
                return Err(OrchestratorError::Spawn {
                    service: slot.name.clone(),
                    source: e,
                });
            }
        };

        let pid = spawned.pid;
        let mut exited = spawned.exited.clone();
        let mut ready = spawned.ready;
        slot.handle = Some(ProcessHandle {
            pid,
            spawned_at: Utc::now(),
            memory_bytes: None,
            exited: spawned.exited.clone(),
            output: spawned.output,
        });
        self.watch_exit(&slot.name, generation, spawned.exited);

        match self
            .await_readiness(descriptor, &mut exited, &mut ready)
            .await
        {
            Readiness::Ready(via) => {
                log::info!("[{}] Ready via {} (pid {})", slot.name, via, pid);
                slot.last_error = None;
                self.transition(slot, ServiceState::Running, None)?;
                self.prober
                    .watch(ProbeTarget {
                        service: slot.name.clone(),
                        generation,
                        endpoint: descriptor.health_endpoint.clone(),
                        grace_period: descriptor.health_grace_period(),
                    })
                    .await;
                Ok(ServiceState::Running)
            }
            Readiness::Exited(exit) => {
                let detail = exit.describe();
                slot.last_error = Some(format!("exited before becoming ready: {}", detail));
                self.park_output(slot);
                self.transition(slot, ServiceState::Failed, Some(detail.clone()))?;
                Err(OrchestratorError::EarlyExit {
                    service: slot.name.clone(),
                    detail,
                })
            }
            Readiness::TimedOut => {
                let timeout_ms = descriptor.readiness_timeout_ms;
                log::warn!(
                    "[{}] Not ready within {}ms, killing pid {}",
                    slot.name,
                    timeout_ms,
                    pid
                );
                self.kill_now(&slot.name, pid, &mut exited, descriptor.kill_timeout())
                    .await;
                slot.last_error = Some(format!("not ready within {}ms", timeout_ms));
                self.park_output(slot);
                self.transition(
                    slot,
                    ServiceState::Failed,
                    Some("readiness timeout".to_string()),
                )?;
                Err(OrchestratorError::ReadinessTimeout {
                    service: slot.name.clone(),
                    timeout_ms,
                })
            }
        }
    }

    /// Wait for a readiness signal or a first successful probe
    async fn await_readiness(
        &self,
        descriptor: &ServiceDescriptor,
        exited: &mut watch::Receiver<Option<ProcessExit>>,
        ready: &mut watch::Receiver<bool>,
    ) -> Readiness {
        let deadline = tokio::time::Instant::now() + descriptor.readiness_timeout();
        let mut poll = tokio::time::interval(self.settings.readiness_poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ready_open = true;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Readiness::TimedOut,
                exit = wait_exit(exited) => return Readiness::Exited(exit),
                signalled = wait_ready(ready), if ready_open => {
                    if signalled {
                        return Readiness::Ready("readiness signal");
                    }
                    // stdout closed without the readiness line
                    ready_open = false;
                }
                _ = poll.tick() => {
                    let probe = self.prober.probe_once(&descriptor.health_endpoint);
                    if let Ok(Ok(())) = tokio::time::timeout_at(deadline, probe).await {
                        return Readiness::Ready("health probe");
                    }
                }
            }
        }
    }

    async fn stop_locked(
        &self,
        slot: &mut ServiceSlot,
        kill_timeout: Duration,
    ) -> Result<ServiceState> {
        if slot.state == ServiceState::Stopped {
            return Ok(ServiceState::Stopped);
        }

        self.prober.cancel(&slot.name).await;
        self.transition(slot, ServiceState::Stopping, None)?;
        self.release_process(slot, kill_timeout).await;
        self.transition(slot, ServiceState::Stopped, None)?;
        Ok(ServiceState::Stopped)
    }

    /// Terminate the slot's process, if any: graceful signal first, then a
    /// forced kill once `kill_timeout` has passed
    async fn release_process(&self, slot: &mut ServiceSlot, kill_timeout: Duration) {
        let Some(handle) = slot.handle.take() else {
            return;
        };
        let mut exited = handle.exited.clone();

        let still_running = exited.borrow().is_none();
        if still_running {
            log::info!("[{}] Stopping process {}...", slot.name, handle.pid);
            match self.control.signal(handle.pid).await {
                Ok(()) | Err(ProcessError::NotRunning(_)) => {}
                Err(e) => log::warn!("[{}] {}", slot.name, e),
            }

            match tokio::time::timeout(kill_timeout, wait_exit(&mut exited)).await {
                Ok(exit) => log::info!("[{}] Process {}", slot.name, exit.describe()),
                Err(_) => {
                    log::warn!(
                        "[{}] Process did not exit gracefully, forcing kill",
                        slot.name
                    );
                    self.kill_now(&slot.name, handle.pid, &mut exited, kill_timeout)
                        .await;
                }
            }
        }

        slot.last_output = Some(handle.output);
    }

    async fn kill_now(
        &self,
        name: &str,
        pid: u32,
        exited: &mut watch::Receiver<Option<ProcessExit>>,
        wait: Duration,
    ) {
        if let Err(e) = self.control.force_kill(pid).await {
            log::debug!("[{}] {}", name, e);
        }
        if tokio::time::timeout(wait, wait_exit(exited)).await.is_err() {
            log::error!("[{}] Process {} did not exit after kill", name, pid);
        }
    }

    /// Drop the handle of an exited process, keeping its output
    fn park_output(&self, slot: &mut ServiceSlot) {
        if let Some(handle) = slot.handle.take() {
            slot.last_output = Some(handle.output);
        }
    }

    fn watch_exit(
        self: &Arc<Self>,
        name: &str,
        generation: u64,
        mut exited: watch::Receiver<Option<ProcessExit>>,
    ) {
        let supervisor: Weak<Self> = Arc::downgrade(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let exit = wait_exit(&mut exited).await;
            if let Some(supervisor) = supervisor.upgrade() {
                supervisor.on_exit(&name, generation, exit).await;
            }
        });
    }

    async fn on_exit(&self, name: &str, generation: u64, exit: ProcessExit) {
        let Some(slot) = self.existing_slot(name).await else {
            return;
        };
        let mut slot = slot.lock().await;
        if slot.generation != generation
            || !matches!(slot.state, ServiceState::Running | ServiceState::Unhealthy)
        {
            return;
        }

        self.prober.cancel(name).await;
        self.park_output(&mut slot);
        let detail = exit.describe();
        log::warn!("[{}] Process {} unexpectedly", name, detail);
        slot.last_error = Some(format!("process {}", detail));
        if let Err(e) = self.transition(&mut slot, ServiceState::Crashed, Some(detail)) {
            log::error!("[{}] {}", name, e);
        }
    }
}

/// Wait for the readiness flag; `false` when it can no longer be set
async fn wait_ready(ready: &mut watch::Receiver<bool>) -> bool {
    ready.wait_for(|r| *r).await.is_ok()
}

/// Wait for the exit notification; a dropped sender counts as an exit
async fn wait_exit(exited: &mut watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    match exited.wait_for(|e| e.is_some()).await {
        Ok(exit) => (*exit).unwrap_or(ProcessExit { code: None }),
        Err(_) => ProcessExit { code: None },
    }
}
