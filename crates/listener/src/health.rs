//! Per-loop status publication and the host-facing health registry.
//!
//! Each loop owns a [`StatusReporter`]; the host holds the matching
//! [`LoopMonitor`]s, usually inside a [`HealthRegistry`] that backs the
//! `GET /health` endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use binding::{LoopHealth, LoopStats, LoopStatus, PollLoopState, TriggerName};
use serde::Serialize;
use tokio::sync::watch;

/// Lock-free counters behind [`LoopStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    acknowledged: AtomicU64,
    ack_failures: AtomicU64,
    receive_failures: AtomicU64,
    abandoned: AtomicU64,
}

/// Which counter to bump.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    Received,
    Succeeded,
    Failed,
    Acknowledged,
    AckFailures,
    ReceiveFailures,
    Abandoned,
}

impl StatsCounters {
    pub(crate) fn add(&self, counter: Counter, n: u64) {
        let cell = match counter {
            Counter::Received => &self.received,
            Counter::Succeeded => &self.succeeded,
            Counter::Failed => &self.failed,
            Counter::Acknowledged => &self.acknowledged,
            Counter::AckFailures => &self.ack_failures,
            Counter::ReceiveFailures => &self.receive_failures,
            Counter::Abandoned => &self.abandoned,
        };
        cell.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub(crate) fn snapshot(&self) -> LoopStats {
        LoopStats {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            receive_failures: self.receive_failures.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Loop-side handle for publishing status changes.
#[derive(Debug)]
pub(crate) struct StatusReporter {
    name: TriggerName,
    tx: watch::Sender<LoopStatus>,
    stats: Arc<StatsCounters>,
}

impl StatusReporter {
    pub(crate) fn new(name: TriggerName) -> Self {
        let (tx, _rx) = watch::channel(LoopStatus::created());
        Self {
            name,
            tx,
            stats: Arc::new(StatsCounters::default()),
        }
    }

    pub(crate) fn set_state(&self, state: PollLoopState) {
        self.tx.send_modify(|status| status.state = state);
    }

    pub(crate) fn set_health(&self, health: LoopHealth) {
        self.tx.send_if_modified(|status| {
            let changed = status.health != health;
            status.health = health;
            changed
        });
    }

    pub(crate) fn stats(&self) -> Arc<StatsCounters> {
        Arc::clone(&self.stats)
    }

    pub(crate) fn monitor(&self) -> LoopMonitor {
        LoopMonitor {
            name: self.name.clone(),
            rx: self.tx.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// Host-side view of one loop.
#[derive(Debug, Clone)]
pub struct LoopMonitor {
    name: TriggerName,
    rx: watch::Receiver<LoopStatus>,
    stats: Arc<StatsCounters>,
}

impl LoopMonitor {
    /// Trigger the loop serves.
    pub fn name(&self) -> &TriggerName {
        &self.name
    }

    /// Latest published status.
    pub fn status(&self) -> LoopStatus {
        *self.rx.borrow()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LoopStats {
        self.stats.snapshot()
    }

    /// Waits until the loop reaches `state`. Returns immediately if it already has.
    pub async fn wait_for_state(&mut self, state: PollLoopState) {
        // An error means the loop (and its sender) is gone; nothing further will change.
        let _ = self.rx.wait_for(|status| status.state == state).await;
    }

    /// Waits until the published health satisfies `predicate`.
    pub async fn wait_for_health<F>(&mut self, mut predicate: F)
    where
        F: FnMut(&LoopHealth) -> bool,
    {
        let _ = self.rx.wait_for(|status| predicate(&status.health)).await;
    }
}

/// Health of one loop as reported by `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    /// Trigger name.
    pub trigger: TriggerName,
    /// Lifecycle and receive health.
    #[serde(flatten)]
    pub status: LoopStatus,
    /// Counters.
    pub stats: LoopStats,
}

/// Every loop's monitor, keyed by trigger name.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    monitors: Arc<RwLock<BTreeMap<TriggerName, LoopMonitor>>>,
}

impl HealthRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the monitor for its trigger.
    pub fn insert(&self, monitor: LoopMonitor) {
        self.monitors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(monitor.name().clone(), monitor);
    }

    /// Reports for every loop, ordered by trigger name.
    pub fn snapshot(&self) -> Vec<TriggerReport> {
        self.monitors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|monitor| TriggerReport {
                trigger: monitor.name().clone(),
                status: monitor.status(),
                stats: monitor.stats(),
            })
            .collect()
    }

    /// `true` when every registered loop is running and none is fatal.
    pub fn is_ready(&self) -> bool {
        self.snapshot().iter().all(|report| report.status.is_ready())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(value: &str) -> TriggerName {
        TriggerName::new(value).unwrap()
    }

    #[test]
    fn monitors_observe_published_status() {
        let reporter = StatusReporter::new(name("orders"));
        let monitor = reporter.monitor();
        assert_eq!(monitor.status(), LoopStatus::created());

        reporter.set_state(PollLoopState::Running);
        reporter.set_health(LoopHealth::Degraded {
            consecutive_failures: 1,
        });
        reporter.stats().incr(Counter::ReceiveFailures);

        let status = monitor.status();
        assert_eq!(status.state, PollLoopState::Running);
        assert!(matches!(status.health, LoopHealth::Degraded { .. }));
        assert_eq!(monitor.stats().receive_failures, 1);
    }

    #[test]
    fn registry_readiness_requires_every_loop_running() {
        let registry = HealthRegistry::new();
        assert!(registry.is_ready());

        let a = StatusReporter::new(name("a"));
        let b = StatusReporter::new(name("b"));
        registry.insert(a.monitor());
        registry.insert(b.monitor());

        a.set_state(PollLoopState::Running);
        assert!(!registry.is_ready());

        b.set_state(PollLoopState::Running);
        assert!(registry.is_ready());

        b.set_health(LoopHealth::Fatal {
            consecutive_failures: 10,
        });
        assert!(!registry.is_ready());

        let names: Vec<String> = registry
            .snapshot()
            .into_iter()
            .map(|r| r.trigger.to_string())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn wait_for_state_resolves_on_transition() {
        let reporter = StatusReporter::new(name("orders"));
        let mut monitor = reporter.monitor();

        let waiter = tokio::spawn(async move {
            monitor.wait_for_state(PollLoopState::Stopped).await;
            monitor.status().state
        });
        reporter.set_state(PollLoopState::Running);
        reporter.set_state(PollLoopState::Stopped);

        assert_eq!(waiter.await.unwrap(), PollLoopState::Stopped);
    }
}
