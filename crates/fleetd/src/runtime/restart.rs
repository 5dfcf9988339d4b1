//! Restart policy engine
//!
//! Turns crash, readiness and health failures into restart directives,
//! enforcing the per-service restart budget, and issues proactive restarts
//! when a service outgrows its memory limit.

use crate::config::ServiceDescriptor;
use crate::runtime::state::{ServiceEvent, ServiceState};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Why a restart was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The process exited while running
    Crash,
    /// Sustained health probe failure
    Unhealthy,
    /// Spawn failed or readiness was not reached in time
    Readiness,
    /// Memory limit exceeded; does not consume restart budget
    Proactive,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestartReason::Crash => "crash",
            RestartReason::Unhealthy => "unhealthy",
            RestartReason::Readiness => "readiness failure",
            RestartReason::Proactive => "memory limit",
        })
    }
}

/// Action the supervisor is asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveAction {
    Restart(RestartReason),
    /// Budget exhausted: mark the service permanently failed
    GiveUp { attempts: u32 },
}

/// Directive sent from the engine to the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartDirective {
    pub service: String,
    pub action: DirectiveAction,
}

/// Outcome of recording one failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Restart after `delay`; `attempt` is the fast-failure count in the window
    Restart { delay: Duration, attempt: u32 },
    GiveUp { attempts: u32 },
}

/// Sliding-window record of fast failures of one service
#[derive(Debug, Default)]
pub struct RestartRecord {
    attempts: VecDeque<Instant>,
}

impl RestartRecord {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(first) = self.attempts.front() {
            if now.saturating_duration_since(*first) > window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn count(&self) -> u32 {
        self.attempts.len() as u32
    }

    fn reset(&mut self) {
        self.attempts.clear();
    }
}

struct PendingTimer {
    id: u64,
    token: CancellationToken,
}

/// Restart policy engine
pub struct RestartPolicyEngine {
    /// Trailing window restarts are counted in
    window: Duration,
    records: RwLock<HashMap<String, Arc<Mutex<RestartRecord>>>>,
    timers: Arc<Mutex<HashMap<String, PendingTimer>>>,
    next_timer_id: AtomicU64,
    /// Services with a proactive restart in flight
    proactive: Mutex<HashSet<String>>,
    root: CancellationToken,
    directive_tx: mpsc::UnboundedSender<RestartDirective>,
}

impl RestartPolicyEngine {
    /// Create an engine; restart timers are children of `root`
    pub fn new(
        window: Duration,
        root: CancellationToken,
        directive_tx: mpsc::UnboundedSender<RestartDirective>,
    ) -> Self {
        Self {
            window,
            records: RwLock::new(HashMap::new()),
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_timer_id: AtomicU64::new(0),
            proactive: Mutex::new(HashSet::new()),
            root,
            directive_tx,
        }
    }

    async fn record(&self, service: &str) -> Arc<Mutex<RestartRecord>> {
        if let Some(record) = self.records.read().await.get(service) {
            return Arc::clone(record);
        }
        let mut records = self.records.write().await;
        Arc::clone(records.entry(service.to_string()).or_default())
    }

    /// Record a failure and decide whether the service may restart.
    ///
    /// Failures after less than `min_uptime` count against the budget;
    /// a failure after a sustained run starts a fresh budget.
    pub async fn record_failure(
        &self,
        descriptor: &ServiceDescriptor,
        uptime: Option<Duration>,
        now: Instant,
    ) -> RestartDecision {
        let record = self.record(&descriptor.name).await;
        let mut record = record.lock().await;

        let uptime = uptime.unwrap_or_default();
        if uptime >= descriptor.min_uptime() {
            record.reset();
        }
        record.prune(now, self.window);
        record.attempts.push_back(now);

        let attempts = record.count();
        if attempts > descriptor.max_restarts {
            RestartDecision::GiveUp { attempts }
        } else {
            RestartDecision::Restart {
                delay: descriptor.restart_delay(),
                attempt: attempts,
            }
        }
    }

    /// Fast failures currently counted against a service's budget
    pub async fn budget_used(&self, service: &str) -> u32 {
        let Some(record) = self.records.read().await.get(service).cloned() else {
            return 0;
        };
        let mut record = record.lock().await;
        record.prune(Instant::now(), self.window);
        record.count()
    }

    /// React to a supervisor transition
    pub async fn on_event(&self, event: &ServiceEvent, descriptor: &ServiceDescriptor) {
        let reason = match event.to {
            ServiceState::Crashed => RestartReason::Crash,
            ServiceState::Unhealthy => RestartReason::Unhealthy,
            ServiceState::Failed => RestartReason::Readiness,
            ServiceState::Running => {
                self.cancel_pending(&event.service).await;
                self.proactive.lock().await.remove(&event.service);
                return;
            }
            ServiceState::Stopping | ServiceState::PermanentlyFailed => {
                self.cancel_pending(&event.service).await;
                return;
            }
            _ => return,
        };

        // An unhealthy service that then dies is one failure, not two
        if event.from == ServiceState::Unhealthy && self.has_pending(&event.service).await {
            return;
        }

        match self.record_failure(descriptor, event.uptime, Instant::now()).await {
            RestartDecision::Restart { delay, attempt } => {
                log::info!(
                    "[{}] Restart {}/{} after {} in {}ms",
                    event.service,
                    attempt,
                    descriptor.max_restarts,
                    reason,
                    delay.as_millis()
                );
                self.schedule(
                    &event.service,
                    DirectiveAction::Restart(reason),
                    delay,
                )
                .await;
            }
            RestartDecision::GiveUp { attempts } => {
                log::error!(
                    "[{}] Restart budget exhausted ({} failures within {}s), giving up",
                    event.service,
                    attempts,
                    self.window.as_secs()
                );
                self.cancel_pending(&event.service).await;
                self.send(RestartDirective {
                    service: event.service.clone(),
                    action: DirectiveAction::GiveUp { attempts },
                });
            }
        }
    }

    /// Compare a memory sample with the service's limit.
    ///
    /// Returns `true` when a proactive restart directive was issued. At most
    /// one is in flight per service until it is running again.
    pub async fn observe_memory(&self, descriptor: &ServiceDescriptor, bytes: u64) -> bool {
        let Some(limit) = descriptor.max_memory_bytes else {
            return false;
        };
        if bytes <= limit {
            return false;
        }
        if !self.proactive.lock().await.insert(descriptor.name.clone()) {
            return false;
        }

        log::warn!(
            "[{}] Memory {} bytes exceeds limit {} bytes, scheduling proactive restart",
            descriptor.name,
            bytes,
            limit
        );
        self.send(RestartDirective {
            service: descriptor.name.clone(),
            action: DirectiveAction::Restart(RestartReason::Proactive),
        });
        true
    }

    /// Clear a proactive-restart marker whose directive was not executed
    pub async fn clear_proactive(&self, service: &str) {
        self.proactive.lock().await.remove(service);
    }

    /// Reset the budget of a service (operator restart)
    pub async fn reset(&self, service: &str) {
        if let Some(record) = self.records.read().await.get(service) {
            record.lock().await.reset();
        }
    }

    /// Drop all bookkeeping of a service
    pub async fn forget(&self, service: &str) {
        self.cancel_pending(service).await;
        self.records.write().await.remove(service);
        self.proactive.lock().await.remove(service);
    }

    /// Cancel a pending restart timer of a service
    pub async fn cancel_pending(&self, service: &str) {
        if let Some(timer) = self.timers.lock().await.remove(service) {
            timer.token.cancel();
            log::debug!("[{}] Pending restart cancelled", service);
        }
    }

    pub async fn has_pending(&self, service: &str) -> bool {
        self.timers.lock().await.contains_key(service)
    }

    async fn schedule(&self, service: &str, action: DirectiveAction, delay: Duration) {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();

        let previous = self.timers.lock().await.insert(
            service.to_string(),
            PendingTimer {
                id,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }

        let directive = RestartDirective {
            service: service.to_string(),
            action,
        };
        let timers = Arc::clone(&self.timers);
        let tx = self.directive_tx.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut timers = timers.lock().await;
                        if timers.get(&directive.service).is_some_and(|t| t.id == id) {
                            timers.remove(&directive.service);
                        }
                    }
                    let _ = tx.send(directive);
                }
            }
        });
    }

    fn send(&self, directive: RestartDirective) {
        if self.directive_tx.send(directive).is_err() {
            log::debug!("Directive channel closed, dropping restart directive");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Criticality, ServiceType};

    fn auth() -> ServiceDescriptor {
        let mut d = ServiceDescriptor::new(
            "auth",
            ServiceType::Core,
            Criticality::Critical,
            "node",
            "/srv/auth",
            "http://127.0.0.1:6021/health",
        );
        d.min_uptime_ms = 10_000;
        d.max_restarts = 3;
        d.restart_delay_ms = 2_000;
        d
    }

    fn engine() -> (RestartPolicyEngine, mpsc::UnboundedReceiver<RestartDirective>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = RestartPolicyEngine::new(Duration::from_secs(60), CancellationToken::new(), tx);
        (engine, rx)
    }

    fn crashed(uptime_ms: u64) -> ServiceEvent {
        ServiceEvent::new("auth", ServiceState::Running, ServiceState::Crashed)
            .with_uptime(Some(Duration::from_millis(uptime_ms)))
    }

    #[tokio::test]
    async fn test_four_fast_crashes_give_up_after_three_restarts() {
        let (engine, _rx) = engine();
        let d = auth();
        let start = Instant::now();

        let mut restarts = 0;
        let mut final_decision = None;
        for i in 0..4u64 {
            let now = start + Duration::from_secs(i * 5);
            match engine
                .record_failure(&d, Some(Duration::from_secs(3)), now)
                .await
            {
                RestartDecision::Restart { delay, .. } => {
                    assert_eq!(delay, Duration::from_millis(2_000));
                    restarts += 1;
                }
                decision => final_decision = Some(decision),
            }
        }

        assert_eq!(restarts, 3);
        assert_eq!(final_decision, Some(RestartDecision::GiveUp { attempts: 4 }));
    }

    #[tokio::test]
    async fn test_sustained_uptime_resets_budget() {
        let (engine, _rx) = engine();
        let d = auth();
        let now = Instant::now();

        for _ in 0..3 {
            engine.record_failure(&d, Some(Duration::from_secs(1)), now).await;
        }
        assert_eq!(engine.budget_used("auth").await, 3);

        let decision = engine
            .record_failure(&d, Some(Duration::from_secs(30)), now)
            .await;
        assert_eq!(
            decision,
            RestartDecision::Restart {
                delay: Duration::from_millis(2_000),
                attempt: 1
            }
        );
    }

    #[tokio::test]
    async fn test_failures_outside_window_are_forgotten() {
        let (engine, _rx) = engine();
        let d = auth();
        let start = Instant::now();

        for i in 0..3u64 {
            engine
                .record_failure(&d, None, start + Duration::from_secs(i))
                .await;
        }
        let later = start + Duration::from_secs(120);
        let decision = engine.record_failure(&d, None, later).await;
        assert!(matches!(decision, RestartDecision::Restart { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn test_memory_breach_issues_one_proactive_restart() {
        let (engine, mut rx) = engine();
        let mut d = auth();
        d.max_memory_bytes = Some(200_000_000);

        assert!(!engine.observe_memory(&d, 150_000_000).await);
        assert!(engine.observe_memory(&d, 250_000_000).await);
        assert!(!engine.observe_memory(&d, 260_000_000).await);

        let directive = rx.recv().await.unwrap();
        assert_eq!(
            directive.action,
            DirectiveAction::Restart(RestartReason::Proactive)
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.budget_used("auth").await, 0);

        // running again re-arms the check
        let running = ServiceEvent::new("auth", ServiceState::Starting, ServiceState::Running);
        engine.on_event(&running, &d).await;
        assert!(engine.observe_memory(&d, 250_000_000).await);
    }

    #[tokio::test]
    async fn test_crash_event_schedules_delayed_restart() {
        let (engine, mut rx) = engine();
        let mut d = auth();
        d.restart_delay_ms = 50;

        engine.on_event(&crashed(500), &d).await;
        assert!(engine.has_pending("auth").await);
        assert!(rx.try_recv().is_err());

        let directive = rx.recv().await.unwrap();
        assert_eq!(directive.action, DirectiveAction::Restart(RestartReason::Crash));
        assert!(!engine.has_pending("auth").await);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_restart() {
        let (engine, mut rx) = engine();
        let mut d = auth();
        d.restart_delay_ms = 50;

        engine.on_event(&crashed(500), &d).await;
        let stopping = ServiceEvent::new("auth", ServiceState::Crashed, ServiceState::Stopping);
        engine.on_event(&stopping, &d).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_then_crash_counts_once() {
        let (engine, _rx) = engine();
        let d = auth();

        let unhealthy = ServiceEvent::new("auth", ServiceState::Running, ServiceState::Unhealthy)
            .with_uptime(Some(Duration::from_secs(1)));
        engine.on_event(&unhealthy, &d).await;
        let crash = ServiceEvent::new("auth", ServiceState::Unhealthy, ServiceState::Crashed)
            .with_uptime(Some(Duration::from_secs(1)));
        engine.on_event(&crash, &d).await;

        assert_eq!(engine.budget_used("auth").await, 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_sends_give_up() {
        let (engine, mut rx) = engine();
        let mut d = auth();
        d.max_restarts = 0;

        engine.on_event(&crashed(100), &d).await;
        let directive = rx.recv().await.unwrap();
        assert_eq!(directive.action, DirectiveAction::GiveUp { attempts: 1 });
        assert!(!engine.has_pending("auth").await);
    }

    #[tokio::test]
    async fn test_reset_and_forget() {
        let (engine, _rx) = engine();
        let d = auth();
        engine.record_failure(&d, None, Instant::now()).await;
        engine.reset("auth").await;
        assert_eq!(engine.budget_used("auth").await, 0);

        engine.record_failure(&d, None, Instant::now()).await;
        engine.forget("auth").await;
        assert_eq!(engine.budget_used("auth").await, 0);
    }
}
