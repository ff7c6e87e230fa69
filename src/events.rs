//! Typed publish/subscribe streams announcing what the supervisor does.
//!
//! Four independent streams exist: status changes, health changes, restarts and
//! errors. Listeners are called in subscription order, on the supervisor task,
//! in the order the underlying transitions happened. A listener that returns an
//! error or panics is logged and skipped.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use serde::Serialize;

use crate::supervisor::WorkerStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub from: WorkerStatus,
    pub to: WorkerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChange {
    pub healthy: bool,
    pub failures: u32,
    pub max_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartScheduled {
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

/// Faults surfaced on the error stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SupervisorFault {
    /// The launcher never reached a live process.
    #[serde(rename_all = "camelCase")]
    StartFailed { reason: String },
    /// The OS could not create the process.
    #[serde(rename_all = "camelCase")]
    SpawnError { reason: String },
    #[serde(rename_all = "camelCase")]
    MaxRestartsReached { restart_count: u32 },
    #[serde(rename_all = "camelCase")]
    HealthFailed { failures: u32 },
    /// The monitor itself faulted, as opposed to the worker failing a probe.
    #[serde(rename_all = "camelCase")]
    HealthCheckError { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    StartFailed,
    SpawnError,
    MaxRestartsReached,
    HealthFailed,
    HealthCheckError,
}

impl SupervisorFault {
    pub fn kind(&self) -> FaultKind {
        match self {
            Self::StartFailed { .. } => FaultKind::StartFailed,
            Self::SpawnError { .. } => FaultKind::SpawnError,
            Self::MaxRestartsReached { .. } => FaultKind::MaxRestartsReached,
            Self::HealthFailed { .. } => FaultKind::HealthFailed,
            Self::HealthCheckError { .. } => FaultKind::HealthCheckError,
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StartFailed => write!(f, "start-failed"),
            Self::SpawnError => write!(f, "spawn-error"),
            Self::MaxRestartsReached => write!(f, "max-restarts-reached"),
            Self::HealthFailed => write!(f, "health-failed"),
            Self::HealthCheckError => write!(f, "health-check-error"),
        }
    }
}

/// Identifies one subscription across all streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

struct Stream<E> {
    name: &'static str,
    listeners: Mutex<Vec<(SubscriptionId, Listener<E>)>>,
}

impl<E> Stream<E> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: SubscriptionId, listener: Listener<E>) {
        self.lock().push((id, listener));
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn emit(&self, event: &E) {
        // Snapshot so listeners may (un)subscribe from inside a callback.
        let listeners: Vec<_> = self.lock().iter().cloned().collect();
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(stream = self.name, subscription = id.0, error = %e, "event listener failed");
                }
                Err(_) => {
                    tracing::error!(stream = self.name, subscription = id.0, "event listener panicked");
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, Listener<E>)>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The four event streams of one supervisor.
pub struct EventBus {
    next_id: AtomicU64,
    status: Stream<StatusChange>,
    health: Stream<HealthChange>,
    restart: Stream<RestartScheduled>,
    error: Stream<SupervisorFault>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            status: Stream::new("status_change"),
            health: Stream::new("health_change"),
            restart: Stream::new("restart"),
            error: Stream::new("error"),
        }
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_status_change<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StatusChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.status.add(id, Arc::new(listener));
        id
    }

    pub fn on_health_change<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&HealthChange) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.health.add(id, Arc::new(listener));
        id
    }

    pub fn on_restart<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&RestartScheduled) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.restart.add(id, Arc::new(listener));
        id
    }

    pub fn on_error<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SupervisorFault) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.error.add(id, Arc::new(listener));
        id
    }

    /// Removes a subscription from whichever stream holds it.
    /// Returns `false` if the id was unknown or already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.status.remove(id)
            || self.health.remove(id)
            || self.restart.remove(id)
            || self.error.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.status.len() + self.health.len() + self.restart.len() + self.error.len()
    }

    pub(crate) fn status_changed(&self, event: StatusChange) {
        self.status.emit(&event);
    }

    pub(crate) fn health_changed(&self, event: HealthChange) {
        self.health.emit(&event);
    }

    pub(crate) fn restart_scheduled(&self, event: RestartScheduled) {
        self.restart.emit(&event);
    }

    pub(crate) fn fault(&self, fault: SupervisorFault) {
        self.error.emit(&fault);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_listeners_do_not_block_the_rest() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.on_error(|_| anyhow::bail!("listener broke"));
        bus.on_error(|_| panic!("listener panicked"));
        let sink = seen.clone();
        bus.on_error(move |fault| {
            sink.lock().unwrap().push(fault.kind());
            Ok(())
        });

        bus.fault(SupervisorFault::MaxRestartsReached { restart_count: 2 });

        assert_eq!(*seen.lock().unwrap(), vec![FaultKind::MaxRestartsReached]);
    }

    #[test]
    fn unsubscribed_listeners_stop_receiving() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let id = bus.on_status_change(move |_| {
            *sink.lock().unwrap() += 1;
            Ok(())
        });

        let change = StatusChange {
            from: WorkerStatus::Stopped,
            to: WorkerStatus::Starting,
        };
        bus.status_changed(change);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.status_changed(change);

        assert_eq!(*seen.lock().unwrap(), 1);
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn streams_are_independent() {
        let bus = EventBus::new();
        let health = Arc::new(Mutex::new(Vec::new()));
        let sink = health.clone();
        bus.on_health_change(move |change| {
            sink.lock().unwrap().push(*change);
            Ok(())
        });

        bus.fault(SupervisorFault::HealthFailed { failures: 3 });
        bus.health_changed(HealthChange {
            healthy: false,
            failures: 1,
            max_failures: 3,
        });

        assert_eq!(health.lock().unwrap().len(), 1);
    }

    #[test]
    fn faults_serialize_with_kebab_case_tag() {
        let json = serde_json::to_value(SupervisorFault::MaxRestartsReached { restart_count: 2 })
            .unwrap();
        assert_eq!(json["type"], "max-restarts-reached");
        assert_eq!(json["restartCount"], 2);
        assert_eq!(
            SupervisorFault::SpawnError {
                reason: "missing".into()
            }
            .kind()
            .to_string(),
            "spawn-error"
        );
    }
}
