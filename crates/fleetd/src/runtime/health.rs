//! Health probing
//!
//! One cancellable probe task per running service. Probes for different
//! services are independent but share a semaphore that bounds how many
//! requests are in flight at once.

use crate::config::HealthSettings;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

/// Values of the JSON `status` field that mark a service unhealthy
const UNHEALTHY_STATUSES: &[&str] = &["unhealthy", "error", "down", "fail", "failed"];

/// Errors produced by a single health probe
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe timed out after {0}ms")]
    Timeout(u64),

    #[error("Probe request failed: {0}")]
    Request(String),

    #[error("Probe returned HTTP {0}")]
    Status(u16),

    #[error("Service reported status '{0}'")]
    Unhealthy(String),
}

/// A single request/response check against a health endpoint
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, endpoint: &str, timeout: Duration) -> Result<(), ProbeError>;
}

/// HTTP `GET` health check.
///
/// A probe succeeds on a 2xx response. When the body is JSON with a
/// `status` field, values such as `"unhealthy"` or `"down"` fail the probe.
pub struct HttpHealthCheck {
    client: reqwest::Client,
}

impl HttpHealthCheck {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpHealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, endpoint: &str, timeout: Duration) -> Result<(), ProbeError> {
        let timeout_ms = timeout.as_millis() as u64;
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout_ms)
            } else {
                ProbeError::Request(e.to_string())
            }
        };

        let response = self
            .client
            .get(endpoint)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(map_err)?;
        check_body(&body)
    }
}

/// Inspect a successful response body for a failing `status` field
fn check_body(body: &[u8]) -> Result<(), ProbeError> {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return Ok(());
    };
    match value.get("status").and_then(|s| s.as_str()) {
        Some(status) if UNHEALTHY_STATUSES.contains(&status.to_ascii_lowercase().as_str()) => {
            Err(ProbeError::Unhealthy(status.to_string()))
        }
        _ => Ok(()),
    }
}

/// Liveness transition reported by the prober
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    /// Consecutive failures reached the threshold
    Unhealthy {
        service: String,
        generation: u64,
        error: ProbeError,
    },
    /// A probe succeeded after the service was reported unhealthy
    Recovered { service: String, generation: u64 },
}

/// Request to start probing one service
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub service: String,
    /// Supervisor generation the probe belongs to
    pub generation: u64,
    pub endpoint: String,
    /// Delay before the first probe
    pub grace_period: Duration,
}

struct ProbeHandle {
    token: CancellationToken,
    failures: Arc<AtomicU32>,
}

/// Schedules periodic probes for running services
pub struct HealthProber {
    checker: Arc<dyn HealthCheck>,
    settings: HealthSettings,
    permits: Arc<Semaphore>,
    probes: Mutex<HashMap<String, ProbeHandle>>,
    root: CancellationToken,
    event_tx: mpsc::UnboundedSender<HealthEvent>,
}

impl HealthProber {
    /// Create a prober; probe tasks are children of `root`
    pub fn new(
        checker: Arc<dyn HealthCheck>,
        settings: HealthSettings,
        root: CancellationToken,
        event_tx: mpsc::UnboundedSender<HealthEvent>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_probes.max(1)));
        Self {
            checker,
            settings,
            permits,
            probes: Mutex::new(HashMap::new()),
            root,
            event_tx,
        }
    }

    /// Start probing a service, replacing any probe it already has
    pub async fn watch(&self, target: ProbeTarget) {
        let token = self.root.child_token();
        let failures = Arc::new(AtomicU32::new(0));

        let previous = self.probes.lock().await.insert(
            target.service.clone(),
            ProbeHandle {
                token: token.clone(),
                failures: Arc::clone(&failures),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        log::debug!(
            "[{}] Probing {} after {}ms grace period",
            target.service,
            target.endpoint,
            target.grace_period.as_millis()
        );

        let task = ProbeTask {
            checker: Arc::clone(&self.checker),
            permits: Arc::clone(&self.permits),
            interval: self.settings.interval(),
            timeout: self.settings.timeout(),
            threshold: self.settings.failure_threshold.max(1),
            failures,
            event_tx: self.event_tx.clone(),
        };
        tokio::spawn(task.run(target, token));
    }

    /// Cancel the probe of a service immediately
    pub async fn cancel(&self, service: &str) {
        if let Some(handle) = self.probes.lock().await.remove(service) {
            handle.token.cancel();
            log::debug!("[{}] Probe cancelled", service);
        }
    }

    /// Consecutive failed probes of a service's current probe
    pub async fn consecutive_failures(&self, service: &str) -> u32 {
        self.probes
            .lock()
            .await
            .get(service)
            .map(|h| h.failures.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of services currently being probed
    pub async fn active_probes(&self) -> usize {
        self.probes.lock().await.len()
    }

    /// Run one probe right away, outside the periodic schedule
    pub async fn probe_once(&self, endpoint: &str) -> Result<(), ProbeError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProbeError::Request("prober is shut down".to_string()))?;
        self.checker.check(endpoint, self.settings.timeout()).await
    }

    /// Cancel every probe
    pub async fn shutdown(&self) {
        let mut probes = self.probes.lock().await;
        for (_, handle) in probes.drain() {
            handle.token.cancel();
        }
    }
}

struct ProbeTask {
    checker: Arc<dyn HealthCheck>,
    permits: Arc<Semaphore>,
    interval: Duration,
    timeout: Duration,
    threshold: u32,
    failures: Arc<AtomicU32>,
    event_tx: mpsc::UnboundedSender<HealthEvent>,
}

impl ProbeTask {
    async fn run(self, target: ProbeTarget, token: CancellationToken) {
        let ProbeTarget {
            service,
            generation,
            endpoint,
            grace_period,
        } = target;

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(grace_period) => {}
        }

        let mut unhealthy = false;
        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = self.probe(&endpoint) => result,
            };

            match result {
                Ok(()) => {
                    self.failures.store(0, Ordering::Relaxed);
                    if unhealthy {
                        unhealthy = false;
                        log::info!("[{}] Health probe recovered", service);
                        let _ = self.event_tx.send(HealthEvent::Recovered {
                            service: service.clone(),
                            generation,
                        });
                    }
                }
                Err(error) => {
                    let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                    log::warn!(
                        "[{}] Health probe failed ({}/{}): {}",
                        service,
                        failures,
                        self.threshold,
                        error
                    );
                    if failures >= self.threshold && !unhealthy {
                        unhealthy = true;
                        let _ = self.event_tx.send(HealthEvent::Unhealthy {
                            service: service.clone(),
                            generation,
                            error,
                        });
                    }
                }
            }

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn probe(&self, endpoint: &str) -> Result<(), ProbeError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProbeError::Request("prober is shut down".to_string()))?;
        self.checker.check(endpoint, self.timeout).await
    }
}
