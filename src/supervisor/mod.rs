pub(crate) mod builder;
pub(crate) mod handle;

use std::{collections::BTreeMap, io, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::SupervisorConfig,
    credential::Credential,
    events::{EventBus, HealthChange, RestartScheduled, StatusChange, SupervisorFault},
    health::{self, HealthProbe, MonitorSettings, ProbeOutcome},
    policy::{self, RestartDecision, RestartTrigger},
    supervisor::handle::{SupervisorHandle, SupervisorMessage},
    worker::{LaunchError, LaunchRequest, Launcher, WorkerExit, WorkerProcess},
};

/// Lifecycle state of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
    Unhealthy,
}

impl WorkerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, WorkerStatus::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, WorkerStatus::Stopped)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Crashed => write!(f, "crashed"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time view of the supervisor, as handed to the host application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatus {
    pub status: WorkerStatus,
    pub restart_count: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_check_failures: u32,
    /// A worker process is currently alive.
    pub is_running: bool,
    pub is_healthy: bool,
    pub credential: Option<Credential>,
    pub port: u16,
    pub host: String,
}

impl SupervisorStatus {
    fn initial(config: &SupervisorConfig) -> Self {
        Self {
            status: WorkerStatus::Stopped,
            restart_count: 0,
            last_health_check: None,
            health_check_failures: 0,
            is_running: false,
            is_healthy: false,
            credential: None,
            port: config.port,
            host: config.host.clone(),
        }
    }
}

/// Messages the supervisor sends to itself from its scheduled tasks.
#[derive(Debug)]
pub(crate) enum InternalMessage {
    HealthReport { epoch: u64, outcome: ProbeOutcome },
    RestartDue { epoch: u64 },
}

/// The mutable aggregate. Only the supervisor task touches it.
struct SupervisorState {
    status: WorkerStatus,
    restart_count: u32,
    health_check_failures: u32,
    last_health_check: Option<DateTime<Utc>>,
    credential: Option<Credential>,
    worker: Option<Box<dyn WorkerProcess>>,
    is_shutting_down: bool,
    /// Set by `shutdown()`; keeps `is_shutting_down` up for good.
    shutdown_latched: bool,
    /// Bumped on every disarm; scheduled work stamped with an older epoch is stale.
    epoch: u64,
    /// Cancels the monitor and pending restarts of the current epoch.
    scope: CancellationToken,
}

impl SupervisorState {
    fn new() -> Self {
        Self {
            status: WorkerStatus::Stopped,
            restart_count: 0,
            health_check_failures: 0,
            last_health_check: None,
            credential: None,
            worker: None,
            is_shutting_down: false,
            shutdown_latched: false,
            epoch: 0,
            scope: CancellationToken::new(),
        }
    }
}

/// Owns the worker process and everything that decides its fate.
///
/// The `Supervisor` runs as a single task: commands from [`SupervisorHandle`]s,
/// probe results, due restarts and the worker's exit are all funneled through one
/// `select!` loop, so the state is never mutated concurrently. Health probes and
/// restart timers run as separate tasks that only ever report back by message.
pub struct Supervisor {
    config: Arc<SupervisorConfig>,
    health_urls: Arc<[String]>,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn HealthProbe>,
    events: Arc<EventBus>,
    state: SupervisorState,
    internal_tx: mpsc::UnboundedSender<InternalMessage>,
    internal_rx: mpsc::UnboundedReceiver<InternalMessage>,
    status_tx: watch::Sender<SupervisorStatus>,
}

impl Supervisor {
    /// Runs the supervisor, consuming it and returning a handle for external control.
    ///
    /// The worker is not started until [`SupervisorHandle::start`] is called.
    pub fn run(self) -> SupervisorHandle {
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let handle = SupervisorHandle::new(
            user_tx,
            self.status_tx.subscribe(),
            self.config.clone(),
            self.events.clone(),
        );
        tokio::spawn(self.supervise(user_rx));
        handle
    }

    /// Main loop. Ends once every handle has been dropped.
    async fn supervise(mut self, mut external_rx: mpsc::UnboundedReceiver<SupervisorMessage>) {
        loop {
            tokio::select! {
                user_msg = external_rx.recv() => match user_msg {
                    Some(msg) => self.handle_user_message(msg).await,
                    None => break,
                },
                Some(internal_msg) = self.internal_rx.recv() => {
                    self.handle_internal_message(internal_msg).await;
                },
                exit = wait_for_exit(&mut self.state.worker) => {
                    self.handle_worker_exit(exit).await;
                }
            }
            self.publish();
        }

        debug!("all supervisor handles dropped, tearing down worker");
        self.state.is_shutting_down = true;
        self.disarm();
        self.retire_worker().await;
        self.transition(WorkerStatus::Stopped);
    }

    async fn handle_user_message(&mut self, msg: SupervisorMessage) {
        match msg {
            SupervisorMessage::Start(reply) => {
                let started = self.start().await;
                let _ = reply.send(started);
            }
            SupervisorMessage::Stop(reply) => {
                let stopped = self.stop().await;
                let _ = reply.send(stopped);
            }
            SupervisorMessage::Restart(reply) => {
                let restarted = self.restart().await;
                let _ = reply.send(restarted);
            }
            SupervisorMessage::Shutdown(reply) => {
                self.state.shutdown_latched = true;
                let stopped = self.stop().await;
                let _ = reply.send(stopped);
            }
        }
    }

    async fn handle_internal_message(&mut self, msg: InternalMessage) {
        match msg {
            InternalMessage::HealthReport { epoch, outcome } => {
                if self.is_stale(epoch) {
                    debug!(epoch, "discarding health report from a disarmed monitor");
                    return;
                }
                self.handle_health_report(outcome);
            }
            InternalMessage::RestartDue { epoch } => {
                if self.is_stale(epoch) {
                    debug!(epoch, "discarding cancelled restart");
                    return;
                }
                self.relaunch().await;
            }
        }
    }

    fn is_stale(&self, epoch: u64) -> bool {
        epoch != self.state.epoch || self.state.is_shutting_down
    }

    /// Explicit start: resets the counters and launches a fresh generation.
    async fn start(&mut self) -> bool {
        if self.state.is_shutting_down {
            warn!("refusing to start worker while shutting down");
            return false;
        }
        if matches!(
            self.state.status,
            WorkerStatus::Starting | WorkerStatus::Running
        ) {
            debug!(status = %self.state.status, "worker already started");
            return true;
        }

        self.state.restart_count = 0;
        self.state.health_check_failures = 0;
        match self.launch().await {
            Ok(()) => true,
            Err(e) => {
                self.handle_launch_failure(e, true);
                false
            }
        }
    }

    /// Best-effort stop. Always ends in `Stopped`.
    async fn stop(&mut self) -> bool {
        self.state.is_shutting_down = true;
        self.disarm();
        if !self.state.status.is_stopped() {
            self.transition(WorkerStatus::Stopping);
        }
        self.retire_worker().await;
        self.transition(WorkerStatus::Stopped);
        self.state.is_shutting_down = self.state.shutdown_latched;
        true
    }

    async fn restart(&mut self) -> bool {
        self.stop().await;
        tokio::time::sleep(self.config.restart_pause).await;
        self.start().await
    }

    /// Restart scheduled by the policy. Keeps the restart count.
    async fn relaunch(&mut self) {
        if let Err(e) = self.launch().await {
            self.handle_launch_failure(e, false);
        }
    }

    /// Spawns a new worker generation with a fresh credential.
    async fn launch(&mut self) -> Result<(), LaunchError> {
        self.disarm();
        if self.retire_worker().await {
            tokio::time::sleep(self.config.restart_pause).await;
        }
        self.transition(WorkerStatus::Starting);

        let credential = Credential::generate();
        let request = self.launch_request(&credential);
        let worker = self.launcher.launch(request).await?;

        info!(pid = worker.id(), "worker is up");
        self.state.worker = Some(worker);
        self.state.credential = Some(credential);
        self.state.health_check_failures = 0;
        self.arm_monitor();
        self.transition(WorkerStatus::Running);
        Ok(())
    }

    fn launch_request(&self, credential: &Credential) -> LaunchRequest {
        let mut env: BTreeMap<String, String> = self.config.extra_env.clone();
        env.insert(
            self.config.credential_env.clone(),
            credential.expose().to_string(),
        );
        env.insert(self.config.port_env.clone(), self.config.port.to_string());
        LaunchRequest {
            executable: self.config.executable.clone(),
            args: self.config.resolved_args(),
            working_dir: self.config.working_dir.clone(),
            env,
            output: self.config.output.clone(),
            grace: self.config.spawn_grace,
        }
    }

    fn handle_launch_failure(&mut self, error: LaunchError, explicit: bool) {
        self.transition(WorkerStatus::Crashed);
        match error {
            LaunchError::Spawn(e) => {
                error!(error = %e, executable = %self.config.executable.display(), "worker could not be spawned");
                self.events.fault(SupervisorFault::SpawnError {
                    reason: e.to_string(),
                });
                self.schedule_restart(RestartTrigger::SpawnError, None);
            }
            LaunchError::ExitedDuringGrace(exit) => {
                warn!(%exit, "worker exited during startup");
                if explicit {
                    self.events.fault(SupervisorFault::StartFailed {
                        reason: format!("worker exited during startup ({exit})"),
                    });
                }
                self.schedule_restart(RestartTrigger::Crash, Some(exit));
            }
        }
    }

    async fn handle_worker_exit(&mut self, exit: io::Result<WorkerExit>) {
        self.state.worker = None;
        self.state.credential = None;
        let exit = exit.unwrap_or_else(|e| {
            warn!(error = %e, "failed to collect worker exit status");
            WorkerExit::default()
        });
        if self.state.is_shutting_down {
            return;
        }

        warn!(%exit, status = %self.state.status, "worker exited unexpectedly");
        self.disarm();
        self.transition(WorkerStatus::Crashed);
        self.schedule_restart(RestartTrigger::Crash, Some(exit));
    }

    fn handle_health_report(&mut self, outcome: ProbeOutcome) {
        let status = self.state.status;
        if !matches!(status, WorkerStatus::Running | WorkerStatus::Unhealthy) {
            return;
        }
        self.state.last_health_check = Some(Utc::now());
        let max_failures = self.config.max_health_check_failures;

        let reason = match outcome {
            ProbeOutcome::Healthy { endpoint } => {
                debug!(%endpoint, "worker is healthy");
                self.state.health_check_failures = 0;
                if status == WorkerStatus::Unhealthy {
                    info!("worker recovered");
                    self.transition(WorkerStatus::Running);
                }
                self.publish();
                self.events.health_changed(HealthChange {
                    healthy: true,
                    failures: 0,
                    max_failures,
                });
                return;
            }
            ProbeOutcome::Unhealthy => None,
            ProbeOutcome::Fault(reason) => Some(reason),
        };

        if let Some(reason) = reason {
            error!(%reason, "health check could not run");
            self.events
                .fault(SupervisorFault::HealthCheckError { reason });
        }
        self.state.health_check_failures = self.state.health_check_failures.saturating_add(1);
        let failures = self.state.health_check_failures;
        warn!(failures, max_failures, "health check failed");
        self.publish();
        self.events.health_changed(HealthChange {
            healthy: false,
            failures,
            max_failures,
        });

        if status == WorkerStatus::Running && failures >= max_failures {
            self.transition(WorkerStatus::Unhealthy);
            self.events
                .fault(SupervisorFault::HealthFailed { failures });
            self.schedule_restart(RestartTrigger::HealthFailure, None);
        }
    }

    /// Consults the restart policy and arms a timer if it allows another attempt.
    fn schedule_restart(&mut self, trigger: RestartTrigger, exit: Option<WorkerExit>) {
        if self.state.is_shutting_down {
            return;
        }
        let max_restarts = self.config.max_restarts;
        let decision = policy::decide(
            self.state.restart_count,
            max_restarts,
            self.config.restart_delay,
            trigger,
        );

        let (attempt, delay) = match decision {
            RestartDecision::Exhausted => {
                error!(
                    restart_count = self.state.restart_count,
                    max_restarts, "worker restart budget exhausted"
                );
                self.events.fault(SupervisorFault::MaxRestartsReached {
                    restart_count: self.state.restart_count,
                });
                return;
            }
            RestartDecision::Attempt { attempt, delay } => (attempt, delay),
        };

        self.disarm();
        self.state.restart_count = attempt;
        info!(
            attempt,
            max_restarts,
            delay_ms = delay.as_millis() as u64,
            ?trigger,
            "scheduling worker restart"
        );
        self.publish();
        self.events.restart_scheduled(RestartScheduled {
            attempt,
            max_attempts: max_restarts,
            delay_ms: delay.as_millis() as u64,
            exit_code: exit.and_then(|e| e.code),
            signal: exit.and_then(|e| e.signal),
        });

        let tx = self.internal_tx.clone();
        let token = self.state.scope.clone();
        let epoch = self.state.epoch;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(InternalMessage::RestartDue { epoch });
                }
            }
        });
    }

    fn arm_monitor(&mut self) {
        let settings = MonitorSettings {
            probe: self.probe.clone(),
            urls: self.health_urls.clone(),
            interval: self.config.health_check_interval,
            timeout: self.config.health_check_timeout,
            epoch: self.state.epoch,
        };
        tokio::spawn(health::monitor(
            settings,
            self.internal_tx.clone(),
            self.state.scope.clone(),
        ));
    }

    /// Cancels every scheduled task of the current epoch.
    fn disarm(&mut self) {
        self.state.scope.cancel();
        self.state.scope = CancellationToken::new();
        self.state.epoch += 1;
    }

    /// Terminates the live worker, if any: graceful signal first, kill after the
    /// stop grace. Errors are logged, never returned.
    async fn retire_worker(&mut self) -> bool {
        self.state.credential = None;
        let Some(mut worker) = self.state.worker.take() else {
            return false;
        };
        let pid = worker.id();

        if let Err(e) = worker.terminate() {
            warn!(pid, error = %e, "failed to signal worker");
        }
        match tokio::time::timeout(self.config.stop_grace, worker.wait()).await {
            Ok(Ok(exit)) => info!(pid, %exit, "worker stopped"),
            Ok(Err(e)) => warn!(pid, error = %e, "error while waiting for worker to stop"),
            Err(_) => {
                warn!(pid, "worker ignored termination request, killing it");
                if let Err(e) = worker.kill().await {
                    warn!(pid, error = %e, "failed to kill worker");
                }
            }
        }
        true
    }

    fn transition(&mut self, to: WorkerStatus) {
        let from = self.state.status;
        if from == to {
            return;
        }
        info!(%from, %to, "worker status changed");
        self.state.status = to;
        self.publish();
        self.events.status_changed(StatusChange { from, to });
    }

    fn snapshot(&self) -> SupervisorStatus {
        let status = self.state.status;
        SupervisorStatus {
            status,
            restart_count: self.state.restart_count,
            last_health_check: self.state.last_health_check,
            health_check_failures: self.state.health_check_failures,
            is_running: self.state.worker.is_some(),
            is_healthy: status.is_running() && self.state.health_check_failures == 0,
            credential: self.state.credential.clone(),
            port: self.config.port,
            host: self.config.host.clone(),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }
}

/// Resolves when the live worker exits; pending forever when there is none.
async fn wait_for_exit(worker: &mut Option<Box<dyn WorkerProcess>>) -> io::Result<WorkerExit> {
    match worker {
        Some(worker) => worker.wait().await,
        None => std::future::pending().await,
    }
}
