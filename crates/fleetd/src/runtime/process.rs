//! Process-control capability and its tokio implementation

use crate::config::ServiceDescriptor;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};

/// Line a child prints on stdout to announce readiness
pub const READY_LINE: &str = "READY=1";

/// Everything needed to spawn one service process
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    /// Service name (for logging)
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub working_directory: PathBuf,
    /// Overlaid on the orchestrator's own environment
    pub environment: BTreeMap<String, String>,
    /// Output lines retained for status reports
    pub log_lines: usize,
}

impl SpawnSpec {
    /// Build the spawn spec for a descriptor, adding the `FLEETD_*` variables
    pub fn from_descriptor(descriptor: &ServiceDescriptor, log_lines: usize) -> Self {
        let mut environment = descriptor.environment.clone();
        environment.insert("FLEETD_SERVICE_NAME".to_string(), descriptor.name.clone());
        environment.insert(
            "FLEETD_INSTANCE_COUNT".to_string(),
            descriptor.instance_count.to_string(),
        );
        environment.insert(
            "FLEETD_EXEC_MODE".to_string(),
            descriptor.execution_mode.as_str().to_string(),
        );

        Self {
            name: descriptor.name.clone(),
            command: descriptor.command.clone(),
            args: descriptor.args.clone(),
            working_directory: descriptor.working_directory.clone(),
            environment,
            log_lines,
        }
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn describe(&self) -> String {
        match self.code {
            Some(code) => format!("exited with code {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// One captured output line
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct OutputLine {
    pub line: String,
    pub is_stderr: bool,
}

/// Bounded ring buffer of a process's recent output
#[derive(Debug, Clone)]
pub struct OutputLog {
    lines: Arc<Mutex<VecDeque<OutputLine>>>,
    capacity: usize,
}

impl OutputLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    pub async fn push(&self, line: String, is_stderr: bool) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().await;
        while lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(OutputLine { line, is_stderr });
    }

    /// Snapshot of the retained lines, oldest first
    pub async fn recent(&self) -> Vec<OutputLine> {
        self.lines.lock().await.iter().cloned().collect()
    }
}

/// Handle returned by [`ProcessControl::spawn`].
///
/// `exited` is the exit notification: it flips from `None` to `Some`
/// exactly once. `ready` flips to `true` when the child announces readiness.
#[derive(Debug, Clone)]
pub struct SpawnedProcess {
    pub pid: u32,
    pub exited: watch::Receiver<Option<ProcessExit>>,
    pub ready: watch::Receiver<bool>,
    pub output: OutputLog,
}

/// Platform capability the supervisor drives processes through
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Spawn the process described by `spec`
    async fn spawn(&self, spec: &SpawnSpec) -> Result<SpawnedProcess, ProcessError>;

    /// Ask the process to terminate gracefully
    async fn signal(&self, pid: u32) -> Result<(), ProcessError>;

    /// Terminate the process immediately
    async fn force_kill(&self, pid: u32) -> Result<(), ProcessError>;

    /// Resident memory of the process in bytes, if it can be observed
    async fn memory_usage(&self, pid: u32) -> Option<u64>;
}

/// [`ProcessControl`] backed by `tokio::process`
pub struct TokioProcessControl {
    /// Per-pid switch that makes the waiter task kill its child
    kill_switches: Arc<Mutex<HashMap<u32, oneshot::Sender<()>>>>,
    system: Mutex<sysinfo::System>,
}

impl TokioProcessControl {
    pub fn new() -> Self {
        Self {
            kill_switches: Arc::new(Mutex::new(HashMap::new())),
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for TokioProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for TokioProcessControl {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<SpawnedProcess, ProcessError> {
        log::info!(
            "[{}] Starting: {} {}",
            spec.name,
            spec.command,
            spec.args.join(" ")
        );

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.environment)
            .current_dir(&spec.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            name: spec.name.clone(),
            source: e,
        })?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::NotRunning(spec.name.clone()))?;

        let output = OutputLog::new(spec.log_lines);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = watch::channel(None);

        // Read stdout
        if let Some(stdout) = child.stdout.take() {
            let name = spec.name.clone();
            let output = output.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::debug!("[{}] {}", name, line);
                    let ready = line.trim() == READY_LINE;
                    output.push(line, false).await;
                    if ready {
                        let _ = ready_tx.send(true);
                    }
                }
            });
        }

        // Read stderr
        if let Some(stderr) = child.stderr.take() {
            let name = spec.name.clone();
            let output = output.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log::warn!("[{}] {}", name, line);
                    output.push(line, true).await;
                }
            });
        }

        let (kill_tx, mut kill_rx) = oneshot::channel();
        self.kill_switches.lock().await.insert(pid, kill_tx);

        // Reap the child and publish its exit
        let switches = Arc::clone(&self.kill_switches);
        let name = spec.name.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => Some(status),
                Ok(()) = &mut kill_rx => None,
            };
            let status = match waited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    log::error!("[{}] Error waiting for process: {}", name, e);
                    None
                }
            };
            switches.lock().await.remove(&pid);
            log::debug!("[{}] Process {} exited with code: {:?}", name, pid, code);
            let _ = exit_tx.send(Some(ProcessExit { code }));
        });

        Ok(SpawnedProcess {
            pid,
            exited: exit_rx,
            ready: ready_rx,
            output,
        })
    }

    async fn signal(&self, pid: u32) -> Result<(), ProcessError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let raw = i32::try_from(pid).map_err(|_| ProcessError::SignalFailed {
                pid,
                reason: "pid out of range".to_string(),
            })?;
            kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|e| match e {
                nix::errno::Errno::ESRCH => ProcessError::NotRunning(pid.to_string()),
                e => ProcessError::SignalFailed {
                    pid,
                    reason: e.to_string(),
                },
            })
        }

        #[cfg(not(unix))]
        {
            // No graceful termination outside unix
            self.force_kill(pid).await
        }
    }

    async fn force_kill(&self, pid: u32) -> Result<(), ProcessError> {
        match self.kill_switches.lock().await.remove(&pid) {
            Some(switch) => {
                let _ = switch.send(());
                Ok(())
            }
            None => Err(ProcessError::NotRunning(pid.to_string())),
        }
    }

    async fn memory_usage(&self, pid: u32) -> Option<u64> {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate};

        let pid = Pid::from_u32(pid);
        let mut system = self.system.lock().await;
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        system.process(pid).map(|p| p.memory())
    }
}

/// Errors that can occur with managed processes
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    #[error("Process '{0}' is not running")]
    NotRunning(String),
}
